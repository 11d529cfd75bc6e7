//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where workers toil endlessly..."
//! 🎬 "One supervisor dared to manage them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor builds every backend from config, opens one lane per source
//! channel, spawns the workers, and waits for all of them to finish.
//!
//! ⚠️ The workers stay private. Like Fight Club, but for async tasks. First rule:
//! you don't pub the workers.
//!
//! 🧠 Knowledge graph:
//! - lane = BufferWorker + DeliveryWorker + the two bounded queues feeding them
//! - sources are not lanes: one SourceWorker per configured source, routing each record
//!   to the lane of its channel (two sources may feed one channel)
//! - shutdown cascades by dropping senders: sources stop → record queues close → buffers
//!   drain and stop → batch queues close → delivery workers finish and stop

pub mod shutdown;
mod workers;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::{error, info};

use crate::app_config::{AppConfig, BackupStoreConfig, EndpointConfig, SourceConfig};
use crate::backends::file::{FileBackupStore, FileSource};
use crate::backends::hec::HecEndpoint;
use crate::backends::in_mem::{InMemoryBackupStore, InMemoryEndpoint, InMemorySource};
use crate::backends::{BackupStoreBackend, EndpointBackend, SourceBackend};
use crate::backup::BackupWriter;
use crate::buffering::{BufferConfig, BufferingStream};
use crate::common::ChannelId;
use crate::composers::ComposerBackend;
use crate::delivery::DeliveryClient;
use crate::filters::FilterSet;
use crate::oplog::{OpLogSnapshot, OperationalLog};
use crate::transforms::TransformerBackend;
use shutdown::ShutdownListener;
use workers::{BufferWorker, DeliveryStage, DeliveryWorker, SourceWorker, Worker};

/// 📦 The Supervisor: because even async tasks need someone hovering over them
/// asking "is it done yet?"
#[derive(Debug)]
pub(crate) struct Supervisor {
    sources: Vec<SourceBackend>,
    channels: BTreeSet<ChannelId>,
    filters: Arc<FilterSet>,
    buffer: BufferConfig,
    stage: DeliveryStage,
    queue_capacity: usize,
    oplog: OperationalLog,
}

impl Supervisor {
    /// 🏗️ Build every backend the config names. Opens files, builds HTTP clients, and
    /// fails loudly if any of that goes wrong, before a single record moves.
    pub(crate) async fn from_config(config: &AppConfig) -> Result<Self> {
        let oplog = OperationalLog::new(&config.oplog);
        let filters = FilterSet::from_config(&config.subscriptions)
            .context("💀 Could not build the subscription filters")?;

        let endpoint = match &config.endpoint {
            EndpointConfig::Hec(hec) => EndpointBackend::Hec(HecEndpoint::new(hec)?),
            EndpointConfig::InMemory => EndpointBackend::InMemory(InMemoryEndpoint::default()),
        };
        let store = match &config.backup.store {
            BackupStoreConfig::File(file) => BackupStoreBackend::File(FileBackupStore::new(file)),
            BackupStoreConfig::InMemory => {
                BackupStoreBackend::InMemory(InMemoryBackupStore::default())
            }
        };

        let mut sources = Vec::with_capacity(config.sources.len());
        for source in &config.sources {
            sources.push(match source {
                SourceConfig::File(file) => SourceBackend::File(FileSource::new(file.clone()).await?),
                SourceConfig::InMemory(mem) => SourceBackend::InMemory(InMemorySource::new(mem.clone())),
            });
        }

        let stage = DeliveryStage {
            transformer: TransformerBackend::from_kind(config.transform),
            composer: ComposerBackend::from_endpoint_type(config.delivery.endpoint_type),
            endpoint_type: config.delivery.endpoint_type,
            client: DeliveryClient::new(endpoint, &config.delivery, oplog.clone()),
            policy: config.backup.mode,
            writer: BackupWriter::new(store, &config.backup, oplog.clone()),
            oplog: oplog.clone(),
        };

        Ok(Self {
            sources,
            channels: config.sources.iter().map(|s| s.channel().clone()).collect(),
            filters: Arc::new(filters),
            buffer: config.buffer.clone(),
            stage,
            queue_capacity: config.runtime.queue_capacity,
            oplog,
        })
    }

    /// 🧵 Open the lanes, release the workers, wait for the last one to clock out.
    pub(crate) async fn run(self, shutdown: ShutdownListener) -> Result<OpLogSnapshot> {
        let mut handles = Vec::new();
        let mut lanes = HashMap::with_capacity(self.channels.len());

        for channel in &self.channels {
            let (record_tx, record_rx) = async_channel::bounded(self.queue_capacity);
            let (batch_tx, batch_rx) = async_channel::bounded(self.queue_capacity);
            handles.push(
                BufferWorker::new(
                    record_rx,
                    batch_tx,
                    BufferingStream::new(&self.buffer),
                    self.oplog.clone(),
                )
                .start(),
            );
            handles.push(DeliveryWorker::new(batch_rx, self.stage.clone(), shutdown.clone()).start());
            lanes.insert(channel.clone(), record_tx);
        }

        let source_count = self.sources.len();
        for source in self.sources {
            handles.push(
                SourceWorker::new(source, self.filters.clone(), lanes.clone(), shutdown.clone())
                    .start(),
            );
        }
        // 🔒 the workers hold the only senders now; when they finish, the lanes close
        drop(lanes);
        info!(
            "🚀 {} lanes open, {source_count} sources flowing",
            self.channels.len()
        );

        let mut failures = Vec::new();
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("💀 worker failed: {e:#}");
                    failures.push(e);
                }
                Err(join_error) => {
                    error!("💀 worker panicked or was cancelled: {join_error}");
                    failures.push(anyhow!(join_error));
                }
            }
        }

        let snapshot = self.oplog.snapshot();
        match failures.into_iter().next() {
            Some(first) => Err(first.context("💀 At least one lane went down before finishing")),
            None => Ok(snapshot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::ScriptedReply;
    use crate::backup::{BackupConfig, BackupPolicy, Compression};
    use crate::composers::EndpointType;
    use crate::delivery::{DeliveryConfig, DeliveryOutcome, Rejection};
    use crate::filters::SubscriptionFilter;
    use crate::oplog::{OpEvent, OpLogConfig};
    use crate::transforms::TransformKind;
    use crate::backup::BackupReason;
    use shutdown::ShutdownTrigger;
    use std::time::Duration;

    struct Rig {
        endpoint: InMemoryEndpoint,
        store: InMemoryBackupStore,
        oplog: OperationalLog,
        supervisor: Supervisor,
    }

    /// 🔧 one record per batch (1 byte threshold), passthrough, raw framing
    fn rig(
        feeds: &[(&str, &[&str])],
        script: Vec<ScriptedReply>,
        policy: BackupPolicy,
        filters: FilterSet,
    ) -> Rig {
        let endpoint = InMemoryEndpoint::scripted(script);
        let store = InMemoryBackupStore::default();
        let oplog = OperationalLog::new(&OpLogConfig {
            journal: true,
            ..OpLogConfig::default()
        });
        let delivery = DeliveryConfig {
            endpoint_type: EndpointType::Raw,
            retry_ceiling: 3,
            backoff_base_ms: 10,
            backoff_cap_ms: 100,
            ..DeliveryConfig::default()
        };
        let backup = BackupConfig {
            mode: policy,
            compression: Compression::None,
            prefix: None,
            local_retry_attempts: 1,
            store: BackupStoreConfig::InMemory,
        };

        let sources = feeds
            .iter()
            .map(|(channel, lines)| {
                SourceBackend::InMemory(InMemorySource::from_payloads(
                    ChannelId::new(*channel),
                    lines.iter().map(|l| l.as_bytes().to_vec()).collect(),
                ))
            })
            .collect();

        let supervisor = Supervisor {
            sources,
            channels: feeds.iter().map(|(c, _)| ChannelId::new(*c)).collect(),
            filters: Arc::new(filters),
            buffer: BufferConfig {
                size_threshold_bytes: 1,
                interval_secs: 60,
            },
            stage: DeliveryStage {
                transformer: TransformerBackend::from_kind(TransformKind::Passthrough),
                composer: ComposerBackend::from_endpoint_type(EndpointType::Raw),
                endpoint_type: EndpointType::Raw,
                client: DeliveryClient::new(
                    EndpointBackend::InMemory(endpoint.clone()),
                    &delivery,
                    oplog.clone(),
                ),
                policy,
                writer: BackupWriter::new(
                    BackupStoreBackend::InMemory(store.clone()),
                    &backup,
                    oplog.clone(),
                ),
                oplog: oplog.clone(),
            },
            queue_capacity: 4,
            oplog: oplog.clone(),
        };
        Rig {
            endpoint,
            store,
            oplog,
            supervisor,
        }
    }

    fn forbidden() -> ScriptedReply {
        ScriptedReply::Outcome(DeliveryOutcome::Nacked(Rejection {
            status: 403,
            reason: "Invalid token".into(),
            retriable: false,
        }))
    }

    fn backed_up_sequences(keys: impl IntoIterator<Item = String>) -> Vec<u64> {
        keys.into_iter()
            .filter_map(|key| {
                let file = key.rsplit('/').next()?.to_string();
                let digits = file.split('-').next_back()?.split('.').next()?.to_string();
                digits.parse().ok()
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_failed_only_keeps_just_the_failures() -> Result<()> {
        let rig = rig(
            &[("app", &["a", "b", "c"])],
            vec![ScriptedReply::Outcome(DeliveryOutcome::Acked), forbidden()],
            BackupPolicy::FailedOnly,
            FilterSet::new(),
        );
        let snapshot = rig.supervisor.run(ShutdownListener::never()).await?;

        assert_eq!(rig.endpoint.received().await.len(), 3);
        assert_eq!(backed_up_sequences(rig.store.objects().await.into_keys()), vec![1]);
        assert_eq!(snapshot.totals.batches_acked, 2);
        assert_eq!(snapshot.totals.batches_backed_up, 1);
        assert_eq!(rig.oplog.backup_failures(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_all_records_backs_up_everything_once() -> Result<()> {
        let rig = rig(
            &[("app", &["a", "b", "c"])],
            vec![ScriptedReply::Outcome(DeliveryOutcome::Acked), forbidden()],
            BackupPolicy::AllRecords,
            FilterSet::new(),
        );
        rig.supervisor.run(ShutdownListener::never()).await?;

        assert_eq!(
            backed_up_sequences(rig.store.objects().await.into_keys()),
            vec![0, 1, 2]
        );
        assert_eq!(rig.store.put_calls(), 3);
        let reasons: Vec<BackupReason> = rig
            .oplog
            .journal()
            .into_iter()
            .filter_map(|event| match event {
                OpEvent::BackupWrite { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(
            reasons,
            vec![
                BackupReason::AllRecords,
                BackupReason::DeliveryFailed,
                BackupReason::AllRecords
            ]
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_each_lane_keeps_its_own_order() -> Result<()> {
        let rig = rig(
            &[("alpha", &["1", "2", "3", "4"]), ("beta", &["5", "6", "7"])],
            vec![ScriptedReply::Outcome(DeliveryOutcome::TimedOut)],
            BackupPolicy::FailedOnly,
            FilterSet::new(),
        );
        rig.supervisor.run(ShutdownListener::never()).await?;

        let received = rig.endpoint.received().await;
        for (channel, expected) in [("alpha", 4u64), ("beta", 3)] {
            let mut sequences: Vec<u64> = received
                .iter()
                .filter(|request| request.channel.as_str() == channel)
                .map(|request| request.sequence)
                .collect();
            // 🔁 the one timed-out attempt shows up twice, right next to its retry
            sequences.dedup();
            assert_eq!(sequences, (0..expected).collect::<Vec<_>>());
        }
        assert!(rig.store.objects().await.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_filter_keeps_the_noise_out() -> Result<()> {
        let mut filters = FilterSet::new();
        filters.insert(SubscriptionFilter::new(ChannelId::new("app"), "ERROR")?)?;
        let rig = rig(
            &[("app", &["level=INFO fine", "level=ERROR boom", "level=DEBUG meh"])],
            Vec::new(),
            BackupPolicy::FailedOnly,
            filters,
        );
        let snapshot = rig.supervisor.run(ShutdownListener::never()).await?;

        let bodies: Vec<String> = rig
            .endpoint
            .received()
            .await
            .into_iter()
            .map(|request| request.body)
            .collect();
        assert_eq!(bodies, vec!["level=ERROR boom\n".to_string()]);
        assert_eq!(snapshot.totals.records_flushed, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_deadline_sends_the_stragglers_to_backup() -> Result<()> {
        let rig = rig(
            &[("app", &["a", "b"])],
            vec![ScriptedReply::Hang],
            BackupPolicy::FailedOnly,
            FilterSet::new(),
        );
        let trigger = ShutdownTrigger::new(Duration::from_secs(5));
        let listener = trigger.listener();
        let pull_the_plug = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
            trigger
        });

        let snapshot = rig.supervisor.run(listener).await?;
        let _trigger = pull_the_plug.await?;

        // 🥶 the hung attempt ran to its ack timeout; nothing new started after the deadline
        assert_eq!(rig.endpoint.received().await.len(), 1);
        assert_eq!(
            backed_up_sequences(rig.store.objects().await.into_keys()),
            vec![0, 1]
        );
        assert_eq!(snapshot.totals.batches_acked, 0);
        assert!(rig.oplog.journal().iter().all(|event| match event {
            OpEvent::BackupWrite { reason, .. } => *reason == BackupReason::ShutdownDeadline,
            _ => true,
        }));
        Ok(())
    }
}
