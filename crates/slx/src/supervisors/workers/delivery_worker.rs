//! 📡 The DeliveryWorker: one batch at a time, start to finish, in sequence order.
//!
//! 🎬 *[a batch arrives. it is transformed. it is framed. it is sent.]*
//! *[it is acknowledged, or it is not. either way, it is accounted for.]*
//! *[only then does the next batch get a turn.]*
//!
//! Per batch: transform → report drops → frame → deliver → backup decision → backup write.
//! Batch N is fully resolved, backup write included, before batch N+1 is even transformed.

use anyhow::{Context, Result};
use async_channel::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use super::Worker;
use crate::backup::{BackupAck, BackupPolicy, BackupWriter, backup_reason};
use crate::common::Batch;
use crate::composers::{Composer, ComposerBackend, EndpointType};
use crate::delivery::{DeliveryClient, DeliveryMachine, DeliveryRequest, Resolution};
use crate::oplog::{OpEvent, OperationalLog};
use crate::supervisors::shutdown::ShutdownListener;
use crate::transforms::{Transform, TransformerBackend};

/// 🧰 Everything a lane needs to resolve a batch. Cloned once per lane; the endpoint's
/// connection pool and the oplog are shared underneath.
#[derive(Debug, Clone)]
pub(in crate::supervisors) struct DeliveryStage {
    pub(in crate::supervisors) transformer: TransformerBackend,
    pub(in crate::supervisors) composer: ComposerBackend,
    pub(in crate::supervisors) endpoint_type: EndpointType,
    pub(in crate::supervisors) client: DeliveryClient,
    pub(in crate::supervisors) policy: BackupPolicy,
    pub(in crate::supervisors) writer: BackupWriter,
    pub(in crate::supervisors) oplog: OperationalLog,
}

#[derive(Debug)]
pub(in crate::supervisors) struct DeliveryWorker {
    rx: Receiver<Batch>,
    stage: DeliveryStage,
    shutdown: ShutdownListener,
}

impl DeliveryWorker {
    pub(in crate::supervisors) fn new(
        rx: Receiver<Batch>,
        stage: DeliveryStage,
        shutdown: ShutdownListener,
    ) -> Self {
        Self {
            rx,
            stage,
            shutdown,
        }
    }

    async fn process(&mut self, batch: Batch) -> Result<()> {
        let stage = &self.stage;
        let result = stage.transformer.transform(&batch);
        let dropped = result.dropped_count();
        if dropped > 0 {
            stage.oplog.record(OpEvent::RecordsDropped {
                channel: batch.channel().clone(),
                sequence: batch.sequence(),
                dropped,
                first_reason: result
                    .not_ready()
                    .find_map(|(_, record)| record.reason.clone()),
            });
        }

        let (resolution, machine) = match stage.composer.compose(&result) {
            Ok(body) => {
                let request = DeliveryRequest {
                    channel: batch.channel().clone(),
                    sequence: batch.sequence(),
                    endpoint_type: stage.endpoint_type,
                    body,
                    event_count: result.ready_events().count(),
                };
                let report = stage
                    .client
                    .deliver(&request, &mut self.shutdown)
                    .await
                    .context(format!(
                        "💀 Delivery of {}#{} broke the state machine",
                        batch.channel(),
                        batch.sequence()
                    ))?;
                (report.resolution, Some(report.machine))
            }
            Err(e) => {
                error!(
                    "💀 could not frame {}#{} for the endpoint: {e:#}",
                    batch.channel(),
                    batch.sequence()
                );
                (Resolution::Rejected, None)
            }
        };

        let Some(reason) = backup_reason(stage.policy, resolution) else {
            trace!("✅ {}#{} acked, nothing to back up", batch.channel(), batch.sequence());
            return Ok(());
        };

        let ack = stage.writer.persist(&batch, reason).await;
        if let (BackupAck::Persisted { .. }, Some(mut machine)) = (&ack, machine) {
            if resolution == Resolution::Acked {
                archive(&mut machine)?;
            }
            trace!(
                "🗄️ {}#{} ends in {} after {} attempts",
                batch.channel(),
                batch.sequence(),
                machine.state(),
                machine.attempts()
            );
        }
        Ok(())
    }
}

fn archive(machine: &mut DeliveryMachine) -> Result<()> {
    machine
        .archive()
        .context("💀 An acked batch refused to be archived")
}

impl Worker for DeliveryWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📡 DeliveryWorker started");
            let mut batches = 0u64;
            while let Ok(batch) = self.rx.recv().await {
                self.process(batch).await?;
                batches += 1;
            }
            debug!("🏁 DeliveryWorker: queue closed after {batches} batches");
            Ok(())
        })
    }
}
