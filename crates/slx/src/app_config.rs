//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Powered by Figment: `SLX_*` environment variables layered under an optional TOML
//! file. Nested keys use a double underscore, so `SLX_DELIVERY__RETRY_CEILING=5` lands in
//! `delivery.retry_ceiling`.
//!
//! 🧠 Knowledge graph:
//! - backend selection is an externally tagged enum, the way serde likes it:
//!   `[endpoint.Hec]`, `[backup.store.File]`, `[[sources]]` + `[sources.File]`,
//!   or the bare string `"InMemory"` for the fakes
//! - `load_config` = extract + [`AppConfig::validate`]. A config that parses but makes no
//!   sense (bad pattern, 5 second ack timeout, zero sources) never gets to read a record

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::{FileBackupConfig, FileSourceConfig, HecEndpointConfig, InMemorySourceConfig};
use crate::backup::BackupConfig;
use crate::buffering::BufferConfig;
use crate::common::ChannelId;
use crate::delivery::DeliveryConfig;
use crate::filters::{FilterSet, SubscriptionFilterConfig};
use crate::oplog::OpLogConfig;
use crate::transforms::TransformKind;

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub transform: TransformKind,
    pub endpoint: EndpointConfig,
    pub backup: BackupConfig,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionFilterConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub oplog: OpLogConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 📡 Where batches go.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum EndpointConfig {
    Hec(HecEndpointConfig),
    /// 🎭 acks everything, remembers everything, sends nothing
    InMemory,
}

/// 🗄️ Where the batches that did not make it (or all of them) go.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum BackupStoreConfig {
    File(FileBackupConfig),
    InMemory,
}

/// 🚰 Where records come from.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum SourceConfig {
    File(FileSourceConfig),
    InMemory(InMemorySourceConfig),
}

impl SourceConfig {
    pub fn channel(&self) -> &ChannelId {
        match self {
            SourceConfig::File(f) => &f.channel,
            SourceConfig::InMemory(i) => &i.channel,
        }
    }
}

/// ⚙️ Knobs for the lanes themselves, not for any one stage.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// 📬 bounded queue depth between stages. Full queue = the upstream stage waits.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// ⏳ how long after Ctrl-C in-flight batches may keep trying before they go to backup
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_queue_capacity() -> usize {
    10
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl AppConfig {
    /// 🚨 Everything that can be wrong with a config that parsed fine.
    pub fn validate(&self) -> Result<()> {
        self.delivery
            .validate()
            .context("💀 The [delivery] section is not going to work.")?;

        ensure!(
            self.buffer.size_threshold_bytes > 0,
            "💀 buffer.size_threshold_bytes must be positive, or every record is its own batch forever."
        );
        ensure!(
            self.buffer.interval_secs > 0,
            "💀 buffer.interval_secs must be positive. A zero interval is a busy loop wearing a hat."
        );
        ensure!(
            self.runtime.queue_capacity > 0,
            "💀 runtime.queue_capacity must be positive. A zero-capacity queue is a wall."
        );
        ensure!(
            !self.sources.is_empty(),
            "💀 No [[sources]] configured. A pipeline with nothing flowing in is just a very expensive pipe."
        );
        ensure!(
            self.backup.local_retry_attempts >= 1,
            "💀 backup.local_retry_attempts must allow at least one write."
        );

        FilterSet::from_config(&self.subscriptions)
            .context("💀 The [[subscriptions]] filters did not survive inspection.")?;

        let source_channels: BTreeSet<&ChannelId> =
            self.sources.iter().map(SourceConfig::channel).collect();
        for subscription in &self.subscriptions {
            if !source_channels.contains(&subscription.channel) {
                tracing::warn!(
                    "🤷 subscription for '{}' matches no configured source; it will never see a record",
                    subscription.channel
                );
            }
        }

        if let EndpointConfig::Hec(hec) = &self.endpoint {
            ensure!(
                !hec.url.trim().is_empty(),
                "💀 endpoint.Hec.url is empty. We need somewhere to send things."
            );
            ensure!(
                !hec.token.trim().is_empty(),
                "💀 endpoint.Hec.token is empty. The collector will say 401 and mean it."
            );
            if let Some(ack) = &hec.indexer_ack {
                ensure!(
                    !ack.channel.trim().is_empty(),
                    "💀 endpoint.Hec.indexer_ack.channel is empty. Indexer ack needs a request channel id."
                );
                ensure!(
                    ack.poll_interval_ms > 0,
                    "💀 endpoint.Hec.indexer_ack.poll_interval_ms must be positive."
                );
            }
        }
        Ok(())
    }
}

/// 🚀 Load the config from `SLX_*` env vars and, if given, a TOML file. Then validate it.
///
/// 📐 No file → env vars only. File → env vars + file, file wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("SLX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (SLX_*). \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (SLX_*). \
                 No file was provided, so this one's all on the environment. Classic."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    app_config.validate()?;
    Ok(app_config)
}
