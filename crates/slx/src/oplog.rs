//! 📓 The Operational Log: the pipeline's diary, read by on-call and nobody else.
//!
//! 🎬 *[every lane writes here. flushes, attempts, backups, the occasional tragedy.]*
//! *[the diary never talks back. it never changes a decision. it just remembers.]*
//!
//! One cloneable handle (an `Arc` inside) shared by every lane. Each recorded
//! [`OpEvent`]:
//! 1. bumps the atomic counters and the per-channel tally (always, whatever the verbosity)
//! 2. is emitted as a structured `tracing` event under target `slx::oplog`
//!    (unless verbosity is `errors_only` and the event is routine)
//! 3. is appended to the in-memory journal, when the journal is switched on. The journal
//!    keeps the newest [`JOURNAL_CAPACITY`] events and forgets older ones
//!
//! 🧠 Knowledge graph:
//! - `backup_failures` is THE externally visible failure counter: a batch that could not
//!   be delivered AND could not be backed up has nowhere else to go
//! - `errors_only` keeps everything at warn or above: failed attempts, dropped records,
//!   failed deliveries, backup failures
//! - no `.await` anywhere in here, so plain `std::sync::Mutex` guards the maps
//!
//! 🦆 (the duck is logged at debug level. it prefers it that way.)

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backup::BackupReason;
use crate::common::{ChannelId, FlushTrigger};
use crate::delivery::Resolution;

/// 🔧 `[oplog]` config section.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct OpLogConfig {
    #[serde(default)]
    pub verbosity: Verbosity,
    /// 📒 also keep the most recent events in memory, for tests and dry runs. Bounded by
    /// [`JOURNAL_CAPACITY`]; the counters and the tracing output are the long-run record.
    #[serde(default)]
    pub journal: bool,
}

/// 📏 How many events the journal holds before the oldest fall off.
pub const JOURNAL_CAPACITY: usize = 10_000;

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    #[default]
    All,
    ErrorsOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// 📨 Everything the pipeline has to say about itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OpEvent {
    Flush {
        channel: ChannelId,
        sequence: u64,
        records: usize,
        bytes: usize,
        trigger: FlushTrigger,
    },
    RecordsDropped {
        channel: ChannelId,
        sequence: u64,
        dropped: usize,
        first_reason: Option<String>,
    },
    DeliveryAttempt {
        channel: ChannelId,
        sequence: u64,
        attempt: u32,
        outcome: String,
        acked: bool,
    },
    DeliveryResolved {
        channel: ChannelId,
        sequence: u64,
        attempts: u32,
        resolution: Resolution,
    },
    BackupWrite {
        channel: ChannelId,
        sequence: u64,
        bytes: usize,
        reason: BackupReason,
        key: String,
    },
    BackupFailed {
        channel: ChannelId,
        sequence: u64,
        reason: BackupReason,
        error: String,
    },
}

impl OpEvent {
    pub fn channel(&self) -> &ChannelId {
        match self {
            OpEvent::Flush { channel, .. }
            | OpEvent::RecordsDropped { channel, .. }
            | OpEvent::DeliveryAttempt { channel, .. }
            | OpEvent::DeliveryResolved { channel, .. }
            | OpEvent::BackupWrite { channel, .. }
            | OpEvent::BackupFailed { channel, .. } => channel,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            OpEvent::Flush { .. } => Severity::Debug,
            OpEvent::RecordsDropped { .. } => Severity::Warn,
            OpEvent::DeliveryAttempt { acked: true, .. } => Severity::Debug,
            OpEvent::DeliveryAttempt { acked: false, .. } => Severity::Warn,
            OpEvent::DeliveryResolved {
                resolution: Resolution::Acked,
                ..
            } => Severity::Info,
            OpEvent::DeliveryResolved { .. } => Severity::Error,
            OpEvent::BackupWrite { .. } => Severity::Info,
            OpEvent::BackupFailed { .. } => Severity::Error,
        }
    }
}

/// 📊 Per-channel running totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelTally {
    pub batches_flushed: u64,
    pub records_flushed: u64,
    pub records_dropped: u64,
    pub delivery_attempts: u64,
    pub batches_acked: u64,
    pub batches_failed: u64,
    pub batches_backed_up: u64,
    pub backup_failures: u64,
}

/// 📸 A point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpLogSnapshot {
    pub totals: ChannelTally,
    pub per_channel: BTreeMap<ChannelId, ChannelTally>,
}

#[derive(Debug, Default)]
struct Counters {
    batches_flushed: AtomicU64,
    records_flushed: AtomicU64,
    records_dropped: AtomicU64,
    delivery_attempts: AtomicU64,
    batches_acked: AtomicU64,
    batches_failed: AtomicU64,
    batches_backed_up: AtomicU64,
    backup_failures: AtomicU64,
}

#[derive(Debug, Default)]
struct Inner {
    verbosity: Verbosity,
    counters: Counters,
    tallies: Mutex<HashMap<ChannelId, ChannelTally>>,
    journal: Option<Mutex<VecDeque<OpEvent>>>,
}

/// 📓 The shared, concurrent-write-safe operational log handle.
#[derive(Debug, Clone, Default)]
pub struct OperationalLog {
    inner: Arc<Inner>,
}

impl OperationalLog {
    pub fn new(config: &OpLogConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                verbosity: config.verbosity,
                counters: Counters::default(),
                tallies: Mutex::new(HashMap::new()),
                journal: config.journal.then(|| Mutex::new(VecDeque::new())),
            }),
        }
    }

    /// 📝 Count it, maybe log it, maybe journal it.
    pub fn record(&self, event: OpEvent) {
        self.count(&event);

        let loud_enough = match self.inner.verbosity {
            Verbosity::All => true,
            Verbosity::ErrorsOnly => event.severity() >= Severity::Warn,
        };
        if loud_enough {
            emit(&event);
        }

        if let Some(journal) = &self.inner.journal {
            let mut journal = journal.lock().unwrap_or_else(PoisonError::into_inner);
            if journal.len() == JOURNAL_CAPACITY {
                journal.pop_front();
            }
            journal.push_back(event);
        }
    }

    /// 💀 The counter that pages someone.
    pub fn backup_failures(&self) -> u64 {
        self.inner.counters.backup_failures.load(Ordering::Relaxed)
    }

    /// 📒 The most recent events, oldest first. Empty when the journal is off.
    pub fn journal(&self) -> Vec<OpEvent> {
        self.inner
            .journal
            .as_ref()
            .map(|journal| {
                journal
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> OpLogSnapshot {
        let c = &self.inner.counters;
        let totals = ChannelTally {
            batches_flushed: c.batches_flushed.load(Ordering::Relaxed),
            records_flushed: c.records_flushed.load(Ordering::Relaxed),
            records_dropped: c.records_dropped.load(Ordering::Relaxed),
            delivery_attempts: c.delivery_attempts.load(Ordering::Relaxed),
            batches_acked: c.batches_acked.load(Ordering::Relaxed),
            batches_failed: c.batches_failed.load(Ordering::Relaxed),
            batches_backed_up: c.batches_backed_up.load(Ordering::Relaxed),
            backup_failures: c.backup_failures.load(Ordering::Relaxed),
        };
        let per_channel = self
            .inner
            .tallies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(channel, tally)| (channel.clone(), tally.clone()))
            .collect();
        OpLogSnapshot {
            totals,
            per_channel,
        }
    }

    fn count(&self, event: &OpEvent) {
        let c = &self.inner.counters;
        let mut tallies = self
            .inner
            .tallies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tally = tallies.entry(event.channel().clone()).or_default();

        match event {
            OpEvent::Flush { records, .. } => {
                c.batches_flushed.fetch_add(1, Ordering::Relaxed);
                c.records_flushed
                    .fetch_add(*records as u64, Ordering::Relaxed);
                tally.batches_flushed += 1;
                tally.records_flushed += *records as u64;
            }
            OpEvent::RecordsDropped { dropped, .. } => {
                c.records_dropped
                    .fetch_add(*dropped as u64, Ordering::Relaxed);
                tally.records_dropped += *dropped as u64;
            }
            OpEvent::DeliveryAttempt { .. } => {
                c.delivery_attempts.fetch_add(1, Ordering::Relaxed);
                tally.delivery_attempts += 1;
            }
            OpEvent::DeliveryResolved { resolution, .. } => {
                if *resolution == Resolution::Acked {
                    c.batches_acked.fetch_add(1, Ordering::Relaxed);
                    tally.batches_acked += 1;
                } else {
                    c.batches_failed.fetch_add(1, Ordering::Relaxed);
                    tally.batches_failed += 1;
                }
            }
            OpEvent::BackupWrite { .. } => {
                c.batches_backed_up.fetch_add(1, Ordering::Relaxed);
                tally.batches_backed_up += 1;
            }
            OpEvent::BackupFailed { .. } => {
                c.backup_failures.fetch_add(1, Ordering::Relaxed);
                tally.backup_failures += 1;
            }
        }
    }
}

fn emit(event: &OpEvent) {
    match event {
        OpEvent::Flush {
            channel,
            sequence,
            records,
            bytes,
            trigger,
        } => debug!(
            target: "slx::oplog",
            channel = %channel,
            sequence,
            records,
            bytes,
            trigger = %trigger,
            "🚽 batch flushed"
        ),
        OpEvent::RecordsDropped {
            channel,
            sequence,
            dropped,
            first_reason,
        } => warn!(
            target: "slx::oplog",
            channel = %channel,
            sequence,
            records = dropped,
            reason = first_reason.as_deref().unwrap_or("unknown"),
            "🗑️ records dropped by the transformer"
        ),
        OpEvent::DeliveryAttempt {
            channel,
            sequence,
            attempt,
            outcome,
            acked: true,
        } => debug!(
            target: "slx::oplog",
            channel = %channel,
            sequence,
            attempt,
            outcome = %outcome,
            "📡 delivery attempt acknowledged"
        ),
        OpEvent::DeliveryAttempt {
            channel,
            sequence,
            attempt,
            outcome,
            acked: false,
        } => warn!(
            target: "slx::oplog",
            channel = %channel,
            sequence,
            attempt,
            outcome = %outcome,
            "📡 delivery attempt failed"
        ),
        OpEvent::DeliveryResolved {
            channel,
            sequence,
            attempts,
            resolution: Resolution::Acked,
        } => info!(
            target: "slx::oplog",
            channel = %channel,
            sequence,
            attempt = attempts,
            outcome = "acked",
            "✅ batch delivered"
        ),
        OpEvent::DeliveryResolved {
            channel,
            sequence,
            attempts,
            resolution,
        } => error!(
            target: "slx::oplog",
            channel = %channel,
            sequence,
            attempt = attempts,
            outcome = %resolution,
            "💀 batch could not be delivered, handing it to backup"
        ),
        OpEvent::BackupWrite {
            channel,
            sequence,
            bytes,
            reason,
            key,
        } => info!(
            target: "slx::oplog",
            channel = %channel,
            sequence,
            bytes,
            reason = %reason,
            key = %key,
            "🗄️ batch backed up"
        ),
        OpEvent::BackupFailed {
            channel,
            sequence,
            reason,
            error,
        } => error!(
            target: "slx::oplog",
            channel = %channel,
            sequence,
            reason = %reason,
            error = %error,
            "🔥 backup write failed, this batch has nowhere left to go"
        ),
    }
}
