//! 🚶 Passthrough Transform: the "I changed nothing and took credit" of transforms 🎭
//!
//! "What did you do yesterday?" "I passed log lines through unchanged."
//! "Any blockers?" "Invalid UTF-8. I refuse to forward it. I have standards."
//!
//! One record in, one [`Event::Text`] out. Gzip is still unwrapped first, because
//! nobody wants to ship a compressed blob as a "line".

use super::{Event, Transform, TransformedRecord};
use crate::common::{LogRecord, decode_payload_text};

/// 🚶 When you want your log lines moved, not understood.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Transform for Passthrough {
    fn transform_record(&self, record: &LogRecord) -> TransformedRecord {
        match decode_payload_text(record.payload()) {
            Ok(text) => TransformedRecord::ready(vec![Event::Text(text.into_owned())]),
            Err(e) => TransformedRecord::failed(e.to_string()),
        }
    }
}
