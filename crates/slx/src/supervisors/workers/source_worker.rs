//! 🚰 The SourceWorker: pulls records, asks the filter, routes survivors to their lane.
//!
//! Stops at end of input or when shutdown is requested, whichever comes first. Either
//! way it drops its senders on the way out, which is how the buffers learn it is over.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_channel::Sender;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::Worker;
use crate::backends::{Source, SourceBackend};
use crate::common::{ChannelId, LogRecord};
use crate::filters::{FilterSet, accept};
use crate::supervisors::shutdown::ShutdownListener;

#[derive(Debug)]
pub(in crate::supervisors) struct SourceWorker {
    source: SourceBackend,
    filters: Arc<FilterSet>,
    lanes: HashMap<ChannelId, Sender<LogRecord>>,
    shutdown: ShutdownListener,
}

impl SourceWorker {
    pub(in crate::supervisors) fn new(
        source: SourceBackend,
        filters: Arc<FilterSet>,
        lanes: HashMap<ChannelId, Sender<LogRecord>>,
        shutdown: ShutdownListener,
    ) -> Self {
        Self {
            source,
            filters,
            lanes,
            shutdown,
        }
    }
}

impl Worker for SourceWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("🚰 SourceWorker started pulling from {:?}", self.source);
            let (mut forwarded, mut filtered) = (0u64, 0u64);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.shutdown.requested() => {
                        info!("🛑 SourceWorker: shutdown requested, no more reading");
                        break;
                    }
                    next = self.source.next_record() => {
                        next.context("💀 SourceWorker's source broke mid-read")?
                    }
                };
                let Some(record) = next else {
                    debug!("🏁 SourceWorker: source exhausted");
                    break;
                };

                if !accept(&record, &self.filters) {
                    trace!("🚫 record on '{}' did not match its subscription filter", record.channel());
                    filtered += 1;
                    continue;
                }

                let Some(lane) = self.lanes.get(record.channel()) else {
                    warn!("🤷 record for '{}' has no lane; dropping it", record.channel());
                    continue;
                };
                lane.send(record).await.context(
                    "💀 SourceWorker: the buffer on the other end of the queue is gone",
                )?;
                forwarded += 1;
            }
            debug!("🚰 SourceWorker done: {forwarded} forwarded, {filtered} filtered out");
            Ok(())
        })
    }
}
