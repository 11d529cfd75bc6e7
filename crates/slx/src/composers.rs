//! 🎬 *[the transformer hands over a stack of events. the endpoint taps its foot.]*
//! *["Raw or event?" it asks. The composer knows.]*
//!
//! 🎼 The Composers module: framing ready events into the request body.
//!
//! 🧠 Knowledge graph:
//! - **Event** (`EventComposer`): each line is `{"event": <event>}`. Posted to `/services/collector/event`.
//! - **Raw** (`RawComposer`): each line is the event itself. Posted to `/services/collector/raw`.
//! - Every line is `\n` terminated, including the last one.
//! - Resolution: from `EndpointType`, same trait → impls → enum dispatcher pattern as
//!   transforms and backends.
//! - Only ready records are framed. Dropped ones never reach a body.
//!
//! 🦆 (the duck composes... symphonies? payloads? both? the duck has no comment.)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::transforms::{Event, TransformResult};

/// 📡 The endpoint "type": how a batch is framed and which collector path it goes to.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    #[default]
    Event,
    Raw,
}

impl EndpointType {
    pub fn collector_path(self) -> &'static str {
        match self {
            EndpointType::Event => "/services/collector/event",
            EndpointType::Raw => "/services/collector/raw",
        }
    }
}

/// 🎼 Frames a transform result's ready events into one request body.
pub(crate) trait Composer: std::fmt::Debug {
    fn compose(&self, result: &TransformResult) -> Result<String>;
}

/// 🎁 `{"event": ...}` per line. Borrowed, so the event is never cloned just to be wrapped.
#[derive(Serialize)]
struct Framed<'a, T: Serialize + ?Sized> {
    event: &'a T,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct EventComposer;

impl Composer for EventComposer {
    fn compose(&self, result: &TransformResult) -> Result<String> {
        let mut body = String::new();
        for event in result.ready_events() {
            let line = match event {
                Event::Json(value) => serde_json::to_string(&Framed { event: value }),
                Event::Text(text) => serde_json::to_string(&Framed {
                    event: text.as_str(),
                }),
            }
            .context("💀 Failed to frame an event. serde_json had one job.")?;
            body.push_str(&line);
            body.push('\n');
        }
        Ok(body)
    }
}

/// 🥩 The event, as-is. Text lines go out verbatim.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawComposer;

impl Composer for RawComposer {
    fn compose(&self, result: &TransformResult) -> Result<String> {
        let mut body = String::new();
        for event in result.ready_events() {
            match event {
                Event::Json(value) => body.push_str(
                    &serde_json::to_string(value)
                        .context("💀 Failed to serialise a raw event.")?,
                ),
                Event::Text(text) => body.push_str(text.trim_end_matches('\n')),
            }
            body.push('\n');
        }
        Ok(body)
    }
}

/// 🎭 The polymorphic composer, resolved from the endpoint type.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ComposerBackend {
    Event(EventComposer),
    Raw(RawComposer),
}

impl ComposerBackend {
    pub(crate) fn from_endpoint_type(endpoint_type: EndpointType) -> Self {
        match endpoint_type {
            EndpointType::Event => Self::Event(EventComposer),
            EndpointType::Raw => Self::Raw(RawComposer),
        }
    }
}

impl Composer for ComposerBackend {
    #[inline]
    fn compose(&self, result: &TransformResult) -> Result<String> {
        match self {
            Self::Event(c) => c.compose(result),
            Self::Raw(c) => c.compose(result),
        }
    }
}
