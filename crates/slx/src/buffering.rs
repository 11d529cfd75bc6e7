//! 🪣 The Buffering Stream: where records wait for their ride.
//!
//! 🎬 *[a bus stop. records queue up. some are small, some are 4 MB stack traces.]*
//! *[the bus leaves when it is full, or when the first passenger has waited too long.]*
//! *[nobody is left at the stop forever. that is the whole promise.]*
//!
//! Records are grouped per channel into an open batch. The open batch closes when
//! either trigger fires first:
//! - 📏 **size**: the running byte size meets or exceeds `size_threshold_bytes` (checked on `append`)
//! - ⏰ **interval**: the oldest record has waited `interval_secs` (checked on `tick`)
//!
//! Closing REMOVES the open batch from the map, so a second trigger has nothing to
//! close. That is the "closed exactly once" property, enforced by ownership instead
//! of a flag.
//!
//! 🧠 Knowledge graph:
//! - the stream is a plain state machine driven by `(record, now)` and `now`; the
//!   buffer worker owns the clock and calls `tick` at `next_deadline()`
//! - `now` is a `tokio::time::Instant` so paused-clock tests move time for free
//! - sequence numbers start at 0 and increase by one per closed batch, per channel

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::common::{Batch, ChannelId, FlushTrigger, LogRecord};

/// 🔧 Buffer thresholds. Whichever trips first closes the batch.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BufferConfig {
    #[serde(default = "default_size_threshold_bytes")]
    pub size_threshold_bytes: usize,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_size_threshold_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_interval_secs() -> u64 {
    60
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size_threshold_bytes: default_size_threshold_bytes(),
            interval_secs: default_interval_secs(),
        }
    }
}

impl BufferConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// 🚧 A batch still accepting records. Never leaves this module.
#[derive(Debug)]
struct OpenBatch {
    records: Vec<LogRecord>,
    size_bytes: usize,
    opened_at: Instant,
}

/// 🪣 Per-channel batching state machine.
#[derive(Debug)]
pub struct BufferingStream {
    size_threshold_bytes: usize,
    interval: Duration,
    open: HashMap<ChannelId, OpenBatch>,
    next_sequence: HashMap<ChannelId, u64>,
}

impl BufferingStream {
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            size_threshold_bytes: config.size_threshold_bytes,
            interval: config.interval(),
            open: HashMap::new(),
            next_sequence: HashMap::new(),
        }
    }

    /// ➕ Add a record to its channel's open batch. Returns the batch if this record filled it.
    pub fn append(&mut self, record: LogRecord, now: Instant) -> Option<Batch> {
        let channel = record.channel().clone();
        let open = self.open.entry(channel.clone()).or_insert_with(|| OpenBatch {
            records: Vec::new(),
            size_bytes: 0,
            opened_at: now,
        });
        open.size_bytes += record.len();
        open.records.push(record);

        if open.size_bytes >= self.size_threshold_bytes {
            return self.close(&channel, FlushTrigger::Size);
        }
        None
    }

    /// ⏰ Close every open batch whose oldest record has waited at least the interval.
    pub fn tick(&mut self, now: Instant) -> Vec<Batch> {
        let mut stale: Vec<ChannelId> = self
            .open
            .iter()
            .filter(|(_, open)| now.saturating_duration_since(open.opened_at) >= self.interval)
            .map(|(channel, _)| channel.clone())
            .collect();
        stale.sort();

        stale
            .iter()
            .filter_map(|channel| self.close(channel, FlushTrigger::Interval))
            .collect()
    }

    /// 📅 When the next interval flush is due, if anything is open at all.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open
            .values()
            .map(|open| open.opened_at + self.interval)
            .min()
    }

    /// 🛑 Close everything that is still open, tagged as a shutdown flush.
    pub fn drain(&mut self) -> Vec<Batch> {
        let mut channels: Vec<ChannelId> = self.open.keys().cloned().collect();
        channels.sort();
        channels
            .iter()
            .filter_map(|channel| self.close(channel, FlushTrigger::Shutdown))
            .collect()
    }

    /// 🔢 Records currently waiting in open batches, across all channels.
    pub fn pending_records(&self) -> usize {
        self.open.values().map(|open| open.records.len()).sum()
    }

    fn close(&mut self, channel: &ChannelId, trigger: FlushTrigger) -> Option<Batch> {
        let open = self.open.remove(channel)?;
        if open.records.is_empty() {
            return None;
        }
        let sequence = self.next_sequence.entry(channel.clone()).or_insert(0);
        let batch = Batch::closed(
            channel.clone(),
            *sequence,
            open.records,
            open.size_bytes,
            trigger,
        );
        *sequence += 1;
        Some(batch)
    }
}
