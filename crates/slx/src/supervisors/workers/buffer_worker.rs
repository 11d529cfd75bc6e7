//! 🪣 The BufferWorker: the only worker with a clock.
//!
//! It waits on two things at once: the next record, and the moment the oldest open
//! batch turns stale. Whichever comes first wins the `select!`. When the record queue
//! closes it drains what is left (trigger `Shutdown`) and closes the batch queue behind it.

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::Worker;
use crate::buffering::BufferingStream;
use crate::common::{Batch, LogRecord};
use crate::oplog::{OpEvent, OperationalLog};

#[derive(Debug)]
pub(in crate::supervisors) struct BufferWorker {
    rx: Receiver<LogRecord>,
    tx: Sender<Batch>,
    stream: BufferingStream,
    oplog: OperationalLog,
}

impl BufferWorker {
    pub(in crate::supervisors) fn new(
        rx: Receiver<LogRecord>,
        tx: Sender<Batch>,
        stream: BufferingStream,
        oplog: OperationalLog,
    ) -> Self {
        Self {
            rx,
            tx,
            stream,
            oplog,
        }
    }

    async fn ship(&self, batch: Batch) -> Result<()> {
        self.oplog.record(OpEvent::Flush {
            channel: batch.channel().clone(),
            sequence: batch.sequence(),
            records: batch.len(),
            bytes: batch.size_bytes(),
            trigger: batch.closed_by(),
        });
        self.tx
            .send(batch)
            .await
            .context("💀 BufferWorker: the delivery side of the lane hung up")
    }
}

async fn stale_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Worker for BufferWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("🪣 BufferWorker started");
            loop {
                let deadline = self.stream.next_deadline();
                tokio::select! {
                    received = self.rx.recv() => match received {
                        Ok(record) => {
                            if let Some(batch) = self.stream.append(record, Instant::now()) {
                                self.ship(batch).await?;
                            }
                        }
                        Err(_) => {
                            let leftovers = self.stream.drain();
                            debug!("🏁 BufferWorker: input closed, draining {} open batches", leftovers.len());
                            for batch in leftovers {
                                self.ship(batch).await?;
                            }
                            return Ok(());
                        }
                    },
                    _ = stale_at(deadline) => {
                        for batch in self.stream.tick(Instant::now()) {
                            self.ship(batch).await?;
                        }
                    }
                }
            }
        })
    }
}
