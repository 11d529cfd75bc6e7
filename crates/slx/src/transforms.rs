//! 🔄 Transforms: the Rosetta Stone between "whatever the source sent" and "what the endpoint eats" 🎭
//!
//! 🎬 COLD OPEN: INT. TRANSLATION BOOTH, 2:47 AM
//!
//! A batch arrives. Some records are gzipped CloudWatch envelopes. Some are plain
//! text. One is a CONTROL_MESSAGE that just wanted to say hi. One is binary garbage
//! that someone swears "used to be UTF-8". The translator takes them one at a time,
//! writes down a verdict for each, and never throws the whole batch out because of
//! one bad apple.
//!
//! ## Contract 📜
//!
//! - `transform(&Batch) -> TransformResult` is a pure function: same batch in, same result out.
//!   No clock, no I/O, no shared state. Safe to call from every lane at once.
//! - Every input record gets exactly one [`TransformedRecord`] with a [`RecordStatus`].
//!   `ready + dropped == input`. Nobody vanishes without paperwork.
//! - A record-level failure is a status, never an `Err`. The batch always proceeds.
//!
//! ## Knowledge Graph 🧠
//! - Pattern: trait → concrete impls → enum dispatcher (`TransformerBackend`) → from config
//! - `CloudWatchEnvelope`: gzip-aware CloudWatch Logs subscription envelope unpacker (default)
//! - `Passthrough`: one UTF-8 record in, one text event out
//! - Downstream: `composers` frames the ready events for the endpoint type
//!
//! ⚠️ The singularity will merge all log formats into pure consciousness.
//! Until then, we serde. 🦆

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{Batch, ChannelId, LogRecord};

pub mod cloudwatch;
pub mod passthrough;

pub use cloudwatch::CloudWatchEnvelope;
pub use passthrough::Passthrough;

/// 🏷️ Per-record verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordStatus {
    /// ✅ delivered-ready: its events go to the endpoint
    Ok,
    /// 🗑️ deliberately discarded (carries no data)
    Dropped,
    /// 💀 could not be decoded or does not fit the target schema
    ProcessingFailed,
}

impl RecordStatus {
    pub fn is_ready(self) -> bool {
        matches!(self, RecordStatus::Ok)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RecordStatus::Ok => "Ok",
            RecordStatus::Dropped => "Dropped",
            RecordStatus::ProcessingFailed => "ProcessingFailed",
        };
        f.write_str(label)
    }
}

/// 📨 One event bound for the endpoint.
///
/// `Json` for structured documents, `Text` for lines that should go out verbatim
/// on a raw endpoint (and get JSON-string-wrapped on an event endpoint).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Json(Value),
    Text(String),
}

/// 🧾 The transform verdict for one input record.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    pub status: RecordStatus,
    /// 📨 empty unless `status` is `Ok`; one record can expand into many events
    pub events: Vec<Event>,
    /// 💬 why it was not ready, for the operational log
    pub reason: Option<String>,
}

impl TransformedRecord {
    pub fn ready(events: Vec<Event>) -> Self {
        Self {
            status: RecordStatus::Ok,
            events,
            reason: None,
        }
    }

    pub fn dropped(reason: impl Into<String>) -> Self {
        Self {
            status: RecordStatus::Dropped,
            events: Vec::new(),
            reason: Some(reason.into()),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: RecordStatus::ProcessingFailed,
            events: Vec::new(),
            reason: Some(reason.into()),
        }
    }
}

/// 📊 The per-batch transform result, one entry per input record, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformResult {
    channel: ChannelId,
    sequence: u64,
    records: Vec<TransformedRecord>,
}

impl TransformResult {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn records(&self) -> &[TransformedRecord] {
        &self.records
    }

    pub fn input_count(&self) -> usize {
        self.records.len()
    }

    pub fn ready_count(&self) -> usize {
        self.records.iter().filter(|r| r.status.is_ready()).count()
    }

    pub fn dropped_count(&self) -> usize {
        self.input_count() - self.ready_count()
    }

    /// 🫙 Nothing to send: every record was dropped, or the batch was empty.
    pub fn is_vacuous(&self) -> bool {
        self.ready_count() == 0
    }

    /// 📨 Every event of every ready record, in order.
    pub fn ready_events(&self) -> impl Iterator<Item = &Event> {
        self.records
            .iter()
            .filter(|r| r.status.is_ready())
            .flat_map(|r| r.events.iter())
    }

    /// 🗑️ The not-ready records with their index in the batch.
    pub fn not_ready(&self) -> impl Iterator<Item = (usize, &TransformedRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.status.is_ready())
    }
}

/// 🔄 Turns one record into its verdict. Implementors must be pure.
pub trait Transform: fmt::Debug + Send + Sync {
    fn transform_record(&self, record: &LogRecord) -> TransformedRecord;

    /// 🔄 Transform a whole batch, one verdict per record.
    fn transform(&self, batch: &Batch) -> TransformResult {
        TransformResult {
            channel: batch.channel().clone(),
            sequence: batch.sequence(),
            records: batch
                .records()
                .iter()
                .map(|record| self.transform_record(record))
                .collect(),
        }
    }
}

/// 🔧 Which transformer a pipeline uses.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    #[default]
    Cloudwatch,
    Passthrough,
}

/// 🎭 The enum dispatcher. Zero-sized arms, a match, done.
#[derive(Debug, Clone, Copy)]
pub enum TransformerBackend {
    Cloudwatch(CloudWatchEnvelope),
    Passthrough(Passthrough),
}

impl TransformerBackend {
    pub fn from_kind(kind: TransformKind) -> Self {
        match kind {
            TransformKind::Cloudwatch => Self::Cloudwatch(CloudWatchEnvelope),
            TransformKind::Passthrough => Self::Passthrough(Passthrough),
        }
    }
}

impl Transform for TransformerBackend {
    #[inline]
    fn transform_record(&self, record: &LogRecord) -> TransformedRecord {
        match self {
            Self::Cloudwatch(t) => t.transform_record(record),
            Self::Passthrough(t) => t.transform_record(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FlushTrigger;
    use std::time::{Duration, UNIX_EPOCH};

    fn batch_of(payloads: &[&[u8]]) -> Batch {
        let channel = ChannelId::new("app");
        let records: Vec<LogRecord> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| {
                LogRecord::new(
                    channel.clone(),
                    p.to_vec(),
                    UNIX_EPOCH + Duration::from_secs(1_700_000_000 + i as u64),
                )
            })
            .collect();
        let size = records.iter().map(LogRecord::len).sum();
        Batch::closed(channel, 3, records, size, FlushTrigger::Size)
    }

    #[test]
    fn the_one_where_ten_go_in_and_ten_come_out_with_paperwork() {
        let fine: &[u8] = b"level=INFO ok";
        let mut payloads: Vec<&[u8]> = vec![fine; 8];
        payloads.push(&[0xff, 0xfe]);
        payloads.push(&[0xc3, 0x28]);
        let result = TransformerBackend::from_kind(TransformKind::Passthrough)
            .transform(&batch_of(&payloads));

        assert_eq!(result.input_count(), 10);
        assert_eq!(result.ready_count(), 8);
        assert_eq!(result.dropped_count(), 2);
        assert_eq!(result.ready_events().count(), 8);
        let failed: Vec<usize> = result.not_ready().map(|(i, _)| i).collect();
        assert_eq!(failed, vec![8, 9]);
        assert_eq!(result.sequence(), 3);
    }

    #[test]
    fn the_one_where_transforming_twice_gives_the_same_answer() {
        let batch = batch_of(&[
            b"not json at all",
            br#"{"messageType":"CONTROL_MESSAGE"}"#,
            br#"{"container_id":"c1","log":"{\"lvl\":\"warn\"}"}"#,
        ]);
        let transformer = TransformerBackend::from_kind(TransformKind::default());
        assert_eq!(transformer.transform(&batch), transformer.transform(&batch));
    }

    #[test]
    fn the_one_where_an_all_dropped_batch_is_vacuous() {
        let batch = batch_of(&[br#"{"messageType":"CONTROL_MESSAGE"}"#]);
        let result = CloudWatchEnvelope.transform(&batch);
        assert!(result.is_vacuous());
        assert_eq!(result.dropped_count(), 1);
    }
}
