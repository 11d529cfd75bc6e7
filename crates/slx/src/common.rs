//! 📦 Common data structures: the building blocks of sluice.
//!
//! 🎬 COLD OPEN: INT. LOG GROUP, 3:47 AM
//!
//! A log line is born. Nobody asked for it. It says `ERROR connection reset`
//! and then it says it again four hundred times. Each copy becomes a
//! [`LogRecord`], tagged with the [`ChannelId`] it came from and the moment
//! it arrived. The records pile up in a [`Batch`], the batch gets shipped,
//! and if the shipping goes badly the batch goes into the backup vault.
//!
//! 🧠 Knowledge graph:
//! - `LogRecord`: immutable, owned by the buffering stage until it is batched
//! - `Batch`: a CLOSED group of records from one channel with a sequence number.
//!   Open batches live privately inside `buffering.rs` and never escape it, so a
//!   `Batch` value existing at all means it was closed exactly once.
//! - `decode_payload_text`: gzip-aware UTF-8 view of a payload, shared by the
//!   record filter and the transformer so both see the same text.
//!
//! 🦆 (the duck is immutable once created, like everything else in here)

use std::borrow::Cow;
use std::fmt;
use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

/// 🏷️ The name of a source channel: one application's log stream, one log group, one lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// 🎯 One log record: opaque payload bytes, the channel it came from, and when it showed up.
///
/// Fields are private on purpose: a record is immutable once created. You can look,
/// you can clone, you cannot touch. Like a museum exhibit, but for log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    channel: ChannelId,
    payload: Vec<u8>,
    arrived_at: SystemTime,
}

impl LogRecord {
    pub fn new(channel: ChannelId, payload: impl Into<Vec<u8>>, arrived_at: SystemTime) -> Self {
        Self {
            channel,
            payload: payload.into(),
            arrived_at,
        }
    }

    /// 🕰️ A record that arrived right now. The common case for sources.
    pub fn arriving_now(channel: ChannelId, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(channel, payload, SystemTime::now())
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn arrived_at(&self) -> SystemTime {
        self.arrived_at
    }

    /// 📏 Payload size in bytes. This is what the buffer thresholds count.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// ⏱️ Arrival time as unix milliseconds. Pre-1970 records get 0 and our sympathy.
    pub fn arrival_millis(&self) -> u64 {
        self.arrived_at
            .duration_since(UNIX_EPOCH)
            .map(|since_epoch| since_epoch.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// 🚪 What closed a batch. Exactly one of these, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// 📏 running byte size met the size threshold
    Size,
    /// ⏰ the oldest record got older than the interval threshold
    Interval,
    /// 🛑 the pipeline is shutting down and the buffers are being drained
    Shutdown,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Interval => "interval",
            FlushTrigger::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

/// 📦 A closed batch: ordered records from ONE channel plus a per-channel sequence number.
///
/// Only the buffering stream can build one (`pub(crate)` constructor), and it only does so
/// at the moment an open batch is closed. After that the batch moves stage to stage by value:
/// transformer, then delivery, then maybe backup. Nobody shares it. Nobody needs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    channel: ChannelId,
    sequence: u64,
    records: Vec<LogRecord>,
    size_bytes: usize,
    closed_by: FlushTrigger,
}

impl Batch {
    pub(crate) fn closed(
        channel: ChannelId,
        sequence: u64,
        records: Vec<LogRecord>,
        size_bytes: usize,
        closed_by: FlushTrigger,
    ) -> Self {
        Self {
            channel,
            sequence,
            records,
            size_bytes,
            closed_by,
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn closed_by(&self) -> FlushTrigger {
        self.closed_by
    }

    /// 🕰️ Arrival of the oldest record. Backup keys are time-partitioned on this,
    /// so the same batch always lands under the same hour bucket.
    pub fn first_arrival(&self) -> SystemTime {
        self.records
            .first()
            .map(LogRecord::arrived_at)
            .unwrap_or(UNIX_EPOCH)
    }
}

// 🔍 gzip members start with 1F 8B and the deflate method byte 08.
pub(crate) const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

/// 🔍 Does this payload look gzipped?
pub(crate) fn is_gzip(payload: &[u8]) -> bool {
    payload.len() >= GZIP_MAGIC.len() && payload[..GZIP_MAGIC.len()] == GZIP_MAGIC
}

/// 💀 The two ways a payload can refuse to become text.
#[derive(Debug, thiserror::Error)]
pub enum PayloadDecodeError {
    #[error("payload looked gzipped but would not inflate: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("payload is not valid UTF-8")]
    Utf8,
}

/// 🔤 Decode a payload into text: gunzip when the magic bytes say so, then UTF-8.
///
/// Plain UTF-8 payloads are borrowed (no allocation). Gzipped payloads are inflated
/// into an owned `String`.
pub(crate) fn decode_payload_text(payload: &[u8]) -> Result<Cow<'_, str>, PayloadDecodeError> {
    if is_gzip(payload) {
        let mut inflated = Vec::with_capacity(payload.len() * 4);
        GzDecoder::new(payload).read_to_end(&mut inflated)?;
        let text = String::from_utf8(inflated).map_err(|_| PayloadDecodeError::Utf8)?;
        return Ok(Cow::Owned(text));
    }
    std::str::from_utf8(payload)
        .map(Cow::Borrowed)
        .map_err(|_| PayloadDecodeError::Utf8)
}


#[cfg(test)]
mod tests {
    use super::test_support::gzip;
    use super::*;
    use std::time::Duration;

    #[test]
    fn the_one_where_plain_text_is_borrowed_not_copied() {
        let text = decode_payload_text(b"hello=world").expect("plain UTF-8 should decode");
        assert!(matches!(text, Cow::Borrowed("hello=world")));
    }

    #[test]
    fn the_one_where_gzip_is_inflated_before_reading() {
        let squished = gzip(b"level=ERROR msg=boom");
        assert!(is_gzip(&squished));
        let text = decode_payload_text(&squished).expect("gzip should inflate");
        assert_eq!(text, "level=ERROR msg=boom");
    }

    #[test]
    fn the_one_where_invalid_utf8_is_refused() {
        let result = decode_payload_text(&[0xff, 0xfe, 0xfd]);
        assert!(matches!(result, Err(PayloadDecodeError::Utf8)));
    }

    #[test]
    fn the_one_where_fake_gzip_magic_fails_loudly() {
        let liar = [0x1f, 0x8b, 0x08, 0x00, 0x01];
        assert!(matches!(
            decode_payload_text(&liar),
            Err(PayloadDecodeError::Gzip(_))
        ));
    }

    #[test]
    fn the_one_where_first_arrival_is_the_oldest_record() {
        let early = UNIX_EPOCH + Duration::from_secs(100);
        let late = UNIX_EPOCH + Duration::from_secs(200);
        let channel = ChannelId::new("app");
        let batch = Batch::closed(
            channel.clone(),
            7,
            vec![
                LogRecord::new(channel.clone(), "a", early),
                LogRecord::new(channel, "b", late),
            ],
            2,
            FlushTrigger::Interval,
        );
        assert_eq!(batch.first_arrival(), early);
        assert_eq!(batch.sequence(), 7);
        assert_eq!(batch.len(), 2);
    }
}
