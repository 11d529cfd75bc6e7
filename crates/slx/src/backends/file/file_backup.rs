use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::backends::{BackupStore, PutOutcome};

// -- 🗄️ FileBackupConfig: the vault's street address. Lives next to the vault. Ethos pattern. 🎯
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FileBackupConfig {
    pub directory: PathBuf,
}

/// 🗄️ A directory tree of backup objects, one file per key.
///
/// Writes go to `<key>.partial` first and are renamed into place, so a reader never
/// sees half an object. A key that already holds the same bytes is left alone (same
/// batch, one copy); a key holding anything else is an error.
#[derive(Debug, Clone)]
pub(crate) struct FileBackupStore {
    root: PathBuf,
}

impl FileBackupStore {
    pub(crate) fn new(config: &FileBackupConfig) -> Self {
        Self {
            root: config.directory.clone(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        ensure!(
            !key.is_empty()
                && relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_))),
            "💀 backup key '{key}' tries to leave the backup directory. Nice try."
        );
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BackupStore for FileBackupStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<PutOutcome> {
        let path = self.path_for(key)?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            let existing = fs::read(&path).await.context(format!(
                "💀 '{}' exists but cannot be read back for comparison.",
                path.display()
            ))?;
            ensure!(
                existing == bytes,
                "💀 backup key '{key}' already holds different bytes. Refusing to call that a copy."
            );
            trace!("🪞 '{}' already backed up, leaving it be", path.display());
            return Ok(PutOutcome::AlreadyPresent);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.context(format!(
                "💀 Could not create backup directory '{}'. The filing cabinet is locked.",
                parent.display()
            ))?;
        }

        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let mut file = fs::File::create(&partial).await.context(format!(
            "💀 Could not create '{}'. Disk full? Read-only? Haunted?",
            partial.display()
        ))?;
        file.write_all(bytes)
            .await
            .context(format!("💀 Writing '{}' failed midway.", partial.display()))?;
        file.sync_all()
            .await
            .context(format!("💀 fsync of '{}' failed.", partial.display()))?;
        drop(file);

        fs::rename(&partial, &path).await.context(format!(
            "💀 Could not move '{}' into place as '{}'.",
            partial.display(),
            path.display()
        ))?;
        Ok(PutOutcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> FileBackupStore {
        FileBackupStore::new(&FileBackupConfig {
            directory: dir.path().to_path_buf(),
        })
    }

    #[tokio::test]
    async fn the_one_where_nested_keys_make_nested_folders() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let key = "backups/app/2024/01/02/03/app-00000000000000000004.ndjson.gz";
        assert_eq!(store(&dir).put(key, b"payload").await?, PutOutcome::Written);

        let written = std::fs::read(dir.path().join(key))?;
        assert_eq!(written, b"payload");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("backups/app/2024/01/02/03"))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_same_bytes_twice_is_a_no_op() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let vault = store(&dir);
        assert_eq!(vault.put("app/k.ndjson", b"first").await?, PutOutcome::Written);
        assert_eq!(vault.put("app/k.ndjson", b"first").await?, PutOutcome::AlreadyPresent);
        assert_eq!(std::fs::read(dir.path().join("app/k.ndjson"))?, b"first");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_restart_collides_with_yesterdays_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // 🔁 two stores over one directory: the process before the crash and the one after
        assert_eq!(store(&dir).put("app/k.ndjson", b"RUN-ONE").await?, PutOutcome::Written);
        let clash = store(&dir).put("app/k.ndjson", b"RUN-TWO").await;
        assert!(clash.is_err());
        assert_eq!(std::fs::read(dir.path().join("app/k.ndjson"))?, b"RUN-ONE");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_percent_encoded_channels_are_just_folders() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let vault = store(&dir);
        vault.put("%2Ea%2Fb/a%2Fb-r1-0.ndjson", b"slash").await?;
        vault.put("a_b/a_b-r1-0.ndjson", b"underscore").await?;
        assert_eq!(std::fs::read(dir.path().join("%2Ea%2Fb/a%2Fb-r1-0.ndjson"))?, b"slash");
        assert_eq!(std::fs::read(dir.path().join("a_b/a_b-r1-0.ndjson"))?, b"underscore");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_keys_cannot_escape_the_vault() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(store(&dir).put("../escape.ndjson", b"x").await.is_err());
        assert!(store(&dir).put("/etc/passwd", b"x").await.is_err());
        Ok(())
    }
}
