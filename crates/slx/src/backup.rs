//! 🗄️ The Backup Store policy layer: what gets saved, under which key, in which shape.
//!
//! 🎬 *[the endpoint said no. three times. the batch turns to the vault.]*
//! *["I can't promise anyone will read you," says the vault. "But you won't be lost."]*
//!
//! 🧠 Knowledge graph:
//! - ONE decision function, [`backup_reason`], maps (policy, how delivery ended) to
//!   "persist with this reason" or "don't". Nobody else branches on the policy.
//! - The RAW records are persisted, before any transform. Replaying a backup means
//!   feeding those records through the pipeline again, with whatever transform is
//!   configured at replay time.
//! - Object format: NDJSON, one line per record:
//!   `{"channel":..,"sequence":..,"arrival_ms":..,"reason":..,"data":"<base64 payload>"}`,
//!   gzip-compressed when `compression = "gzip"`.
//! - Key: `<prefix><channel>/<YYYY>/<MM>/<DD>/<HH>/<channel>-<run>-<sequence:020>.ndjson[.gz]`,
//!   bucketed on the batch's first arrival in UTC, channel percent-encoded. Same run and
//!   batch → same key → one copy. A key already holding different bytes is an error,
//!   never a silent "already there".
//! - A write that keeps failing after `local_retry_attempts` is logged at error
//!   severity and counted in `backup_failures`. There is no vault behind the vault.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::app_config::BackupStoreConfig;
use crate::backends::{BackupStore, BackupStoreBackend, PutOutcome};
use crate::common::{Batch, ChannelId};
use crate::delivery::Resolution;
use crate::oplog::{OpEvent, OperationalLog};

/// 🔧 `[backup]` config section.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BackupConfig {
    #[serde(default)]
    pub mode: BackupPolicy,
    #[serde(default)]
    pub compression: Compression,
    /// 📁 prepended to every key; a `/` is added when missing
    #[serde(default)]
    pub prefix: Option<String>,
    /// 🔁 total write attempts per batch before giving up
    #[serde(default = "default_local_retry_attempts")]
    pub local_retry_attempts: u32,
    pub store: BackupStoreConfig,
}

fn default_local_retry_attempts() -> u32 {
    3
}

/// 📜 Which batches go to the vault. Fixed for the pipeline's lifetime.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupPolicy {
    /// 💀 only what could not be delivered
    #[default]
    FailedOnly,
    /// 🗃️ everything, delivered or not
    #[serde(alias = "all")]
    AllRecords,
}

/// 🏷️ Why a batch was persisted. Written into every backed-up line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupReason {
    DeliveryFailed,
    AllRecords,
    ShutdownDeadline,
}

impl fmt::Display for BackupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackupReason::DeliveryFailed => "delivery_failed",
            BackupReason::AllRecords => "all_records",
            BackupReason::ShutdownDeadline => "shutdown_deadline",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    Gzip,
    None,
}

impl Compression {
    fn extension(self) -> &'static str {
        match self {
            Compression::Gzip => "ndjson.gz",
            Compression::None => "ndjson",
        }
    }
}

/// ⚖️ The single backup decision: should this batch be persisted, and why?
pub fn backup_reason(policy: BackupPolicy, resolution: Resolution) -> Option<BackupReason> {
    match (policy, resolution) {
        (_, Resolution::Rejected | Resolution::Exhausted) => Some(BackupReason::DeliveryFailed),
        (_, Resolution::Abandoned) => Some(BackupReason::ShutdownDeadline),
        (BackupPolicy::FailedOnly, Resolution::Acked) => None,
        (BackupPolicy::AllRecords, Resolution::Acked) => Some(BackupReason::AllRecords),
    }
}

/// 🧼 Channel names like `/aws/lambda/checkout` become `%2Faws%2Flambda%2Fcheckout` in keys.
///
/// Every byte outside `[A-Za-z0-9_-]` is percent-encoded (`%` and `.` included), so two
/// different channels never share a segment and no segment can be `.` or `..`.
fn key_segment(channel: &ChannelId) -> String {
    let mut segment = String::with_capacity(channel.as_str().len());
    for byte in channel.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            segment.push(char::from(byte));
        } else {
            segment.push_str(&format!("%{byte:02X}"));
        }
    }
    segment
}

static RUNS_STARTED: AtomicU32 = AtomicU32::new(0);

/// 🪪 A fresh run id: UTC start time to the millisecond, process id, and a per-process
/// counter. Never contains a `-`, so the sequence stays the last `-` field of a file name.
pub fn new_run_id() -> String {
    format!(
        "{}.{}.{}",
        Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
        std::process::id(),
        RUNS_STARTED.fetch_add(1, Ordering::Relaxed)
    )
}

/// 🔑 The backup key for a batch. Pure: same run, same batch, same key, every time.
///
/// Sequences restart at 0 with every process, so `run` keeps a restarted pipeline
/// from landing on the previous run's keys.
pub fn backup_key(prefix: Option<&str>, run: &str, batch: &Batch, compression: Compression) -> String {
    let prefix = match prefix.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) if p.ends_with('/') => p.to_string(),
        Some(p) => format!("{p}/"),
        None => String::new(),
    };
    let channel = key_segment(batch.channel());
    let bucket: DateTime<Utc> = batch.first_arrival().into();
    format!(
        "{prefix}{channel}/{}/{channel}-{run}-{:020}.{}",
        bucket.format("%Y/%m/%d/%H"),
        batch.sequence(),
        compression.extension()
    )
}

#[derive(Serialize)]
struct BackupLine<'a> {
    channel: &'a ChannelId,
    sequence: u64,
    arrival_ms: u64,
    reason: BackupReason,
    data: String,
}

/// 📦 Serialise a batch's raw records into the backup object body.
pub fn encode_batch(batch: &Batch, reason: BackupReason, compression: Compression) -> Result<Vec<u8>> {
    let mut ndjson = Vec::with_capacity(batch.size_bytes() * 4 / 3 + batch.len() * 96);
    for record in batch.records() {
        let line = BackupLine {
            channel: batch.channel(),
            sequence: batch.sequence(),
            arrival_ms: record.arrival_millis(),
            reason,
            data: STANDARD.encode(record.payload()),
        };
        serde_json::to_writer(&mut ndjson, &line)
            .context("💀 Could not serialise a backup line.")?;
        ndjson.push(b'\n');
    }

    match compression {
        Compression::None => Ok(ndjson),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(&ndjson)
                .context("💀 gzip refused the backup body.")?;
            encoder
                .finish()
                .context("💀 gzip could not finish the backup body.")
        }
    }
}

/// 🧾 How a persist call ended. Failure is already logged and counted by the time you see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BackupAck {
    Persisted { key: String, bytes: usize },
    Failed,
}

/// 🗄️ Encodes, keys and writes batches, retrying the write locally before giving up.
#[derive(Debug, Clone)]
pub(crate) struct BackupWriter {
    store: BackupStoreBackend,
    compression: Compression,
    prefix: Option<String>,
    run: String,
    attempts: u32,
    retry_delay: Duration,
    oplog: OperationalLog,
}

impl BackupWriter {
    pub(crate) fn new(store: BackupStoreBackend, config: &BackupConfig, oplog: OperationalLog) -> Self {
        Self {
            store,
            compression: config.compression,
            prefix: config.prefix.clone(),
            run: new_run_id(),
            attempts: config.local_retry_attempts.max(1),
            retry_delay: Duration::from_millis(200),
            oplog,
        }
    }

    /// 🪪 Pin the run id instead of minting one.
    #[cfg(test)]
    pub(crate) fn with_run(mut self, run: &str) -> Self {
        self.run = run.to_string();
        self
    }

    /// 🗄️ Persist one batch. Returns once it is stored or every local attempt failed.
    pub(crate) async fn persist(&self, batch: &Batch, reason: BackupReason) -> BackupAck {
        let key = backup_key(self.prefix.as_deref(), &self.run, batch, self.compression);
        let body = match encode_batch(batch, reason, self.compression) {
            Ok(body) => body,
            Err(e) => return self.failed(batch, reason, &e),
        };

        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.store.put(&key, &body).await {
                Ok(outcome) => {
                    if outcome == PutOutcome::AlreadyPresent {
                        debug!("🪞 {key} was already in the vault; keeping the existing copy");
                    }
                    self.oplog.record(OpEvent::BackupWrite {
                        channel: batch.channel().clone(),
                        sequence: batch.sequence(),
                        bytes: body.len(),
                        reason,
                        key: key.clone(),
                    });
                    return BackupAck::Persisted {
                        key,
                        bytes: body.len(),
                    };
                }
                Err(e) => {
                    warn!(
                        "🔁 backup write {attempt}/{} for {}#{} failed: {e:#}",
                        self.attempts,
                        batch.channel(),
                        batch.sequence()
                    );
                    last_error = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay * attempt).await;
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| anyhow::anyhow!("no write attempts were made"));
        self.failed(batch, reason, &error)
    }

    fn failed(&self, batch: &Batch, reason: BackupReason, error: &anyhow::Error) -> BackupAck {
        self.oplog.record(OpEvent::BackupFailed {
            channel: batch.channel().clone(),
            sequence: batch.sequence(),
            reason,
            error: format!("{error:#}"),
        });
        BackupAck::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::FileBackupConfig;
    use crate::backends::file::FileBackupStore;
    use crate::backends::in_mem::InMemoryBackupStore;
    use crate::common::{FlushTrigger, LogRecord};
    use crate::oplog::OpLogConfig;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::time::UNIX_EPOCH;

    fn batch(channel: &str, sequence: u64) -> Batch {
        batch_of(channel, sequence, b"level=ERROR a")
    }

    fn batch_of(channel: &str, sequence: u64, first: &[u8]) -> Batch {
        let channel = ChannelId::new(channel);
        // 🕰️ 2024-03-05T07:08:09Z
        let arrived = UNIX_EPOCH + Duration::from_secs(1_709_622_489);
        let records = vec![
            LogRecord::new(channel.clone(), first.to_vec(), arrived),
            LogRecord::new(channel.clone(), vec![0x1f, 0x8b, 0x08], arrived + Duration::from_secs(1)),
        ];
        Batch::closed(channel, sequence, records, 16, FlushTrigger::Size)
    }

    fn decoded_channels(objects: &std::collections::BTreeMap<String, Vec<u8>>) -> Vec<String> {
        objects
            .values()
            .filter_map(|body| {
                let line = String::from_utf8_lossy(body).lines().next()?.to_string();
                let value: serde_json::Value = serde_json::from_str(&line).ok()?;
                value["channel"].as_str().map(str::to_string)
            })
            .collect()
    }

    fn config(compression: Compression, local_retry_attempts: u32) -> BackupConfig {
        BackupConfig {
            mode: BackupPolicy::FailedOnly,
            compression,
            prefix: Some("backups".into()),
            local_retry_attempts,
            store: BackupStoreConfig::InMemory,
        }
    }

    #[test]
    fn the_one_where_the_decision_table_is_the_whole_policy() {
        use BackupPolicy::*;
        use Resolution::*;
        assert_eq!(backup_reason(FailedOnly, Acked), None);
        assert_eq!(backup_reason(FailedOnly, Rejected), Some(BackupReason::DeliveryFailed));
        assert_eq!(backup_reason(FailedOnly, Exhausted), Some(BackupReason::DeliveryFailed));
        assert_eq!(backup_reason(FailedOnly, Abandoned), Some(BackupReason::ShutdownDeadline));
        assert_eq!(backup_reason(AllRecords, Acked), Some(BackupReason::AllRecords));
        assert_eq!(backup_reason(AllRecords, Exhausted), Some(BackupReason::DeliveryFailed));
    }

    #[test]
    fn the_one_where_keys_are_bucketed_by_hour() {
        let key = backup_key(
            Some("backups"),
            "r1",
            &batch("/aws/lambda/checkout", 42),
            Compression::Gzip,
        );
        assert_eq!(
            key,
            "backups/%2Faws%2Flambda%2Fcheckout/2024/03/05/07/%2Faws%2Flambda%2Fcheckout-r1-00000000000000000042.ndjson.gz"
        );
        let bare = backup_key(None, "r1", &batch("app", 1), Compression::None);
        assert_eq!(bare, "app/2024/03/05/07/app-r1-00000000000000000001.ndjson");
    }

    #[test]
    fn the_one_where_lookalike_channels_get_their_own_keys() {
        let key = |channel: &str| backup_key(None, "r1", &batch(channel, 0), Compression::None);
        assert_ne!(key("a/b"), key("a_b"));
        assert_ne!(key(".app"), key("app"));
        assert_ne!(key("a%2Fb"), key("a/b"));
        assert_eq!(key(".."), "%2E%2E/2024/03/05/07/%2E%2E-r1-00000000000000000000.ndjson");
    }

    #[test]
    fn the_one_where_every_run_gets_its_own_name() {
        let first = new_run_id();
        let second = new_run_id();
        assert_ne!(first, second);
        assert!(!first.contains('-') && !first.contains('/'));
        assert_ne!(
            backup_key(None, &first, &batch("app", 0), Compression::None),
            backup_key(None, &second, &batch("app", 0), Compression::None)
        );
    }

    #[test]
    fn the_one_where_the_backup_keeps_the_raw_bytes() -> Result<()> {
        let body = encode_batch(&batch("app", 3), BackupReason::DeliveryFailed, Compression::Gzip)?;
        let mut ndjson = String::new();
        GzDecoder::new(body.as_slice()).read_to_string(&mut ndjson)?;

        let lines: Vec<serde_json::Value> = ndjson
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["reason"], "delivery_failed");
        assert_eq!(lines[0]["sequence"], 3);
        assert_eq!(lines[0]["arrival_ms"], 1_709_622_489_000u64);
        let raw = STANDARD.decode(lines[1]["data"].as_str().unwrap_or_default())?;
        assert_eq!(raw, vec![0x1f, 0x8b, 0x08]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_flaky_vault_gets_another_chance() {
        let store = InMemoryBackupStore::failing(2);
        let oplog = OperationalLog::new(&OpLogConfig::default());
        let writer = BackupWriter::new(
            BackupStoreBackend::InMemory(store.clone()),
            &config(Compression::None, 3),
            oplog.clone(),
        );

        let ack = writer.persist(&batch("app", 0), BackupReason::DeliveryFailed).await;
        assert!(matches!(ack, BackupAck::Persisted { .. }));
        assert_eq!(store.put_calls(), 3);
        assert_eq!(oplog.backup_failures(), 0);
        assert_eq!(oplog.snapshot().totals.batches_backed_up, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_vault_is_gone_for_good() {
        let store = InMemoryBackupStore::failing(u32::MAX);
        let oplog = OperationalLog::new(&OpLogConfig::default());
        let writer = BackupWriter::new(
            BackupStoreBackend::InMemory(store.clone()),
            &config(Compression::Gzip, 3),
            oplog.clone(),
        );

        let ack = writer.persist(&batch("app", 0), BackupReason::DeliveryFailed).await;
        assert_eq!(ack, BackupAck::Failed);
        assert_eq!(store.put_calls(), 3);
        assert_eq!(oplog.backup_failures(), 1);
    }

    #[tokio::test]
    async fn the_one_where_persisting_twice_leaves_one_copy() {
        let store = InMemoryBackupStore::default();
        let writer = BackupWriter::new(
            BackupStoreBackend::InMemory(store.clone()),
            &config(Compression::Gzip, 1),
            OperationalLog::default(),
        );
        let b = batch("app", 5);
        let first = writer.persist(&b, BackupReason::AllRecords).await;
        let second = writer.persist(&b, BackupReason::AllRecords).await;
        assert_eq!(first, second);
        assert_eq!(store.objects().await.len(), 1);
    }

    #[tokio::test]
    async fn the_one_where_lookalike_channels_both_reach_the_vault() {
        let store = InMemoryBackupStore::default();
        let oplog = OperationalLog::new(&OpLogConfig::default());
        let writer = BackupWriter::new(
            BackupStoreBackend::InMemory(store.clone()),
            &config(Compression::None, 1),
            oplog.clone(),
        );

        for channel in ["a/b", "a_b", ".app", "app"] {
            let ack = writer.persist(&batch(channel, 0), BackupReason::DeliveryFailed).await;
            assert!(matches!(ack, BackupAck::Persisted { .. }), "💀 {channel} was not persisted");
        }

        let objects = store.objects().await;
        assert_eq!(objects.len(), 4);
        let mut channels = decoded_channels(&objects);
        channels.sort();
        assert_eq!(channels, vec![".app", "a/b", "a_b", "app"]);
        assert_eq!(oplog.backup_failures(), 0);
    }

    #[tokio::test]
    async fn the_one_where_a_taken_key_with_other_bytes_is_a_failure() {
        let store = InMemoryBackupStore::default();
        let oplog = OperationalLog::new(&OpLogConfig::default());
        let writer = BackupWriter::new(
            BackupStoreBackend::InMemory(store.clone()),
            &config(Compression::None, 1),
            oplog.clone(),
        );

        let b = batch("app", 0);
        let first = writer.persist(&b, BackupReason::DeliveryFailed).await;
        let clash = writer.persist(&b, BackupReason::AllRecords).await;
        assert!(matches!(first, BackupAck::Persisted { .. }));
        assert_eq!(clash, BackupAck::Failed);
        assert_eq!(oplog.backup_failures(), 1);
        assert_eq!(oplog.snapshot().totals.batches_backed_up, 1);
    }

    #[tokio::test]
    async fn the_one_where_a_restart_does_not_overwrite_the_last_run() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let vault = || {
            BackupStoreBackend::File(FileBackupStore::new(&FileBackupConfig {
                directory: dir.path().to_path_buf(),
            }))
        };
        let oplog = OperationalLog::new(&OpLogConfig::default());
        let before = BackupWriter::new(vault(), &config(Compression::None, 1), oplog.clone());
        let after = BackupWriter::new(vault(), &config(Compression::None, 1), oplog.clone());

        let BackupAck::Persisted { key: first, .. } = before
            .persist(&batch_of("app", 0, b"RUN-ONE"), BackupReason::DeliveryFailed)
            .await
        else {
            panic!("💀 the first run could not back up");
        };
        let BackupAck::Persisted { key: second, .. } = after
            .persist(&batch_of("app", 0, b"RUN-TWO"), BackupReason::DeliveryFailed)
            .await
        else {
            panic!("💀 the restarted run could not back up");
        };

        assert_ne!(first, second);
        let line = |key: &str| -> Result<serde_json::Value> {
            let body = std::fs::read_to_string(dir.path().join(key))?;
            Ok(serde_json::from_str(body.lines().next().unwrap_or_default())?)
        };
        assert_eq!(STANDARD.decode(line(&first)?["data"].as_str().unwrap_or_default())?, b"RUN-ONE");
        assert_eq!(STANDARD.decode(line(&second)?["data"].as_str().unwrap_or_default())?, b"RUN-TWO");
        assert_eq!(oplog.backup_failures(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_pinned_run_collides_loudly_on_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let vault = || {
            BackupStoreBackend::File(FileBackupStore::new(&FileBackupConfig {
                directory: dir.path().to_path_buf(),
            }))
        };
        let oplog = OperationalLog::new(&OpLogConfig::default());
        let before = BackupWriter::new(vault(), &config(Compression::None, 1), oplog.clone()).with_run("same");
        let after = BackupWriter::new(vault(), &config(Compression::None, 1), oplog.clone()).with_run("same");

        let first = before
            .persist(&batch_of("app", 0, b"RUN-ONE"), BackupReason::DeliveryFailed)
            .await;
        let second = after
            .persist(&batch_of("app", 0, b"RUN-TWO"), BackupReason::DeliveryFailed)
            .await;
        assert!(matches!(first, BackupAck::Persisted { .. }));
        assert_eq!(second, BackupAck::Failed);
        assert_eq!(oplog.backup_failures(), 1);
        Ok(())
    }
}
