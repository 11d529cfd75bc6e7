//! ☁️ CloudWatch Logs envelope transform: unpacking subscription deliveries one record at a time.
//!
//! 🎬 *[a gzipped envelope lands on the desk. it is addressed to "whoever is on call".]*
//!
//! A record is, in order of suspicion:
//!
//! | Payload | Verdict |
//! |---|---|
//! | gzip that will not inflate / not UTF-8 | `ProcessingFailed` |
//! | `{"messageType":"DATA_MESSAGE", ...}` | `Ok`, one event per `logEvents[]` entry, enriched |
//! | `{"messageType":"CONTROL_MESSAGE"}` | `Dropped` (a reachability probe, no data) |
//! | `{"messageType":"<anything else>"}` | `ProcessingFailed` |
//! | `{"container_id":..,"log":"<json>"}` | `Ok`, the `log` JSON merged into the document |
//! | any other JSON | `Ok`, unchanged |
//! | plain text | `Ok`, `{"timestamp": <arrival>, "message": <text>}` |
//!
//! 🧠 Synthesised timestamps come from the record's arrival time, never from the
//! wall clock, so transforming the same record twice gives the same bytes.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{Event, Transform, TransformedRecord};
use crate::common::{LogRecord, decode_payload_text};

const DATA_MESSAGE: &str = "DATA_MESSAGE";
const CONTROL_MESSAGE: &str = "CONTROL_MESSAGE";

/// ☁️ The default transformer.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloudWatchEnvelope;

impl Transform for CloudWatchEnvelope {
    fn transform_record(&self, record: &LogRecord) -> TransformedRecord {
        let text = match decode_payload_text(record.payload()) {
            Ok(text) => text,
            Err(e) => return TransformedRecord::failed(e.to_string()),
        };

        let document = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(document)) => document,
            // 📝 scalars and arrays are "JSON" only on a technicality; ship them as-is
            Ok(other) => return TransformedRecord::ready(vec![Event::Json(other)]),
            Err(_) => {
                return TransformedRecord::ready(vec![Event::Json(plaintext_event(
                    &text, record,
                ))]);
            }
        };

        if let Some(message_type) = document.get("messageType") {
            return match message_type.as_str() {
                Some(DATA_MESSAGE) => unpack_data_message(&document, record),
                Some(CONTROL_MESSAGE) => TransformedRecord::dropped("CONTROL_MESSAGE"),
                _ => TransformedRecord::failed(format!("unknown messageType {message_type}")),
            };
        }

        if document.contains_key("container_id") && document.contains_key("log") {
            return TransformedRecord::ready(vec![Event::Json(Value::Object(
                merge_container_log(document),
            ))]);
        }

        TransformedRecord::ready(vec![Event::Json(Value::Object(document))])
    }
}

/// 🕰️ `2024-01-02T03:04:05.123456Z`
fn rfc3339_micros(record: &LogRecord) -> String {
    let arrived: DateTime<Utc> = record.arrived_at().into();
    arrived.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn plaintext_event(text: &str, record: &LogRecord) -> Value {
    let mut event = Map::new();
    event.insert("timestamp".into(), Value::String(rfc3339_micros(record)));
    event.insert("message".into(), Value::String(text.to_string()));
    Value::Object(event)
}

fn unpack_data_message(envelope: &Map<String, Value>, record: &LogRecord) -> TransformedRecord {
    let field = |name: &str| envelope.get(name).cloned().unwrap_or(Value::Null);
    let owner = field("owner");
    let log_group = field("logGroup");
    let log_stream = field("logStream");

    let Some(log_events) = envelope.get("logEvents").and_then(Value::as_array) else {
        return TransformedRecord::failed("DATA_MESSAGE without a logEvents array");
    };

    let mut events = Vec::with_capacity(log_events.len());
    for log_event in log_events {
        let Value::Object(mut enriched) = log_event.clone() else {
            return TransformedRecord::failed("logEvents entry is not an object");
        };
        enriched.insert("owner".into(), owner.clone());
        enriched.insert("log_group".into(), log_group.clone());
        enriched.insert("log_stream".into(), log_stream.clone());
        if !enriched.contains_key("timestamp") {
            enriched.insert("timestamp".into(), Value::String(rfc3339_micros(record)));
        }
        events.push(Event::Json(Value::Object(enriched)));
    }
    TransformedRecord::ready(events)
}

/// 🐳 Container runtimes wrap the app's JSON line in a `log` string. Unwrap it when it parses.
fn merge_container_log(mut document: Map<String, Value>) -> Map<String, Value> {
    let parsed = document
        .get("log")
        .and_then(Value::as_str)
        .and_then(|log| serde_json::from_str::<Value>(log).ok());

    if let Some(Value::Object(inner)) = parsed {
        document.extend(inner);
        document.remove("log");
    }
    document
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ChannelId;
    use crate::common::test_support::gzip;
    use crate::transforms::RecordStatus;
    use serde_json::json;
    use std::time::{Duration, UNIX_EPOCH};

    fn record(payload: &[u8]) -> LogRecord {
        LogRecord::new(
            ChannelId::new("lambda"),
            payload.to_vec(),
            UNIX_EPOCH + Duration::from_micros(1_700_000_000_123_456),
        )
    }

    fn only_json(out: &TransformedRecord) -> &Value {
        match out.events.as_slice() {
            [Event::Json(value)] => value,
            other => panic!("💀 expected exactly one JSON event, got {other:?}"),
        }
    }

    #[test]
    fn the_one_where_a_data_message_fans_out_into_enriched_events() {
        let envelope = json!({
            "messageType": "DATA_MESSAGE",
            "owner": "123456789012",
            "logGroup": "/aws/lambda/checkout",
            "logStream": "2024/01/01/[$LATEST]abc",
            "subscriptionFilters": ["errors"],
            "logEvents": [
                {"id": "1", "timestamp": 1700000000000u64, "message": "boom"},
                {"id": "2", "message": "no clock on this one"}
            ]
        });
        let out = CloudWatchEnvelope.transform_record(&record(&gzip(envelope.to_string().as_bytes())));

        assert_eq!(out.status, RecordStatus::Ok);
        assert_eq!(out.events.len(), 2);
        let Event::Json(first) = &out.events[0] else {
            panic!("💀 expected JSON")
        };
        assert_eq!(first["log_group"], "/aws/lambda/checkout");
        assert_eq!(first["owner"], "123456789012");
        assert_eq!(first["timestamp"], 1700000000000u64);
        let Event::Json(second) = &out.events[1] else {
            panic!("💀 expected JSON")
        };
        assert_eq!(second["timestamp"], "2023-11-14T22:13:20.123456Z");
        assert_eq!(second["log_stream"], "2024/01/01/[$LATEST]abc");
    }

    #[test]
    fn the_one_where_control_messages_are_politely_dropped() {
        let out = CloudWatchEnvelope
            .transform_record(&record(br#"{"messageType":"CONTROL_MESSAGE","logEvents":[]}"#));
        assert_eq!(out.status, RecordStatus::Dropped);
        assert!(out.events.is_empty());
    }

    #[test]
    fn the_one_where_mystery_message_types_fail_processing() {
        let out = CloudWatchEnvelope.transform_record(&record(br#"{"messageType":"SURPRISE"}"#));
        assert_eq!(out.status, RecordStatus::ProcessingFailed);
    }

    #[test]
    fn the_one_where_container_logs_get_unwrapped() {
        let out = CloudWatchEnvelope.transform_record(&record(
            br#"{"container_id":"c0ffee","log":"{\"level\":\"error\",\"msg\":\"oom\"}"}"#,
        ));
        let doc = only_json(&out);
        assert_eq!(doc["level"], "error");
        assert_eq!(doc["container_id"], "c0ffee");
        assert!(doc.get("log").is_none());
    }

    #[test]
    fn the_one_where_container_logs_that_are_not_json_stay_put() {
        let out = CloudWatchEnvelope
            .transform_record(&record(br#"{"container_id":"c0ffee","log":"plain words"}"#));
        assert_eq!(only_json(&out)["log"], "plain words");
    }

    #[test]
    fn the_one_where_plain_text_gets_a_timestamp_from_its_arrival() {
        let out = CloudWatchEnvelope.transform_record(&record(b"level=ERROR msg=timeout"));
        let doc = only_json(&out);
        assert_eq!(doc["message"], "level=ERROR msg=timeout");
        assert_eq!(doc["timestamp"], "2023-11-14T22:13:20.123456Z");
    }

    #[test]
    fn the_one_where_ordinary_json_is_left_alone() {
        let out = CloudWatchEnvelope.transform_record(&record(br#"{"a":1,"b":[true]}"#));
        assert_eq!(only_json(&out), &json!({"a": 1, "b": [true]}));
    }

    #[test]
    fn the_one_where_broken_gzip_is_a_processing_failure() {
        let out = CloudWatchEnvelope.transform_record(&record(&[0x1f, 0x8b, 0x08, 0x00]));
        assert_eq!(out.status, RecordStatus::ProcessingFailed);
    }
}
