//! 🚦 The Record Filter: the bouncer at the door of every lane.
//!
//! 🎬 *[a log line approaches the velvet rope]*
//! *[the bouncer checks the list. the list is a pattern.]*
//! *[the log line says `level=DEBUG`. the bouncer says "not tonight".]*
//!
//! Each channel has at most ONE subscription filter. A record whose channel has no
//! filter walks straight in. A record whose channel has a filter gets in only if the
//! pattern matches its payload text (gzip-aware, see [`crate::common`]).
//!
//! 🧠 Knowledge graph:
//! - patterns are compiled when the config is loaded (`FilterSet::from_config`), so a
//!   typo in a pattern kills startup instead of silently dropping a day of logs
//! - `accept` is a pure function of (record, filters): no clock, no I/O, no mood swings
//! - a payload that cannot be decoded to text only passes the empty pattern

pub mod pattern;

use std::collections::HashMap;

use serde::Deserialize;

use crate::common::{ChannelId, LogRecord, decode_payload_text};
pub use pattern::{FilterPattern, PatternError};

/// 🔧 One subscription filter as it appears in the config.
///
/// ```toml
/// [[subscriptions]]
/// channel = "checkout-service"
/// pattern = "?ERROR ?WARN -healthcheck"
/// ```
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SubscriptionFilterConfig {
    pub channel: ChannelId,
    /// 🎯 absent or empty = match everything
    #[serde(default)]
    pub pattern: String,
}

/// 💀 Why a filter set refused to be built.
#[derive(Debug, thiserror::Error)]
pub enum FilterSetError {
    #[error("channel '{0}' already has a subscription filter; one per channel is the limit")]
    DuplicateChannel(ChannelId),
    #[error("subscription filter for channel '{channel}' has an invalid pattern: {source}")]
    InvalidPattern {
        channel: ChannelId,
        #[source]
        source: PatternError,
    },
}

/// 🚦 A compiled subscription filter for one channel.
#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    channel: ChannelId,
    source: String,
    pattern: FilterPattern,
}

impl SubscriptionFilter {
    pub fn new(channel: ChannelId, pattern: &str) -> Result<Self, FilterSetError> {
        let compiled =
            FilterPattern::parse(pattern).map_err(|source| FilterSetError::InvalidPattern {
                channel: channel.clone(),
                source,
            })?;
        Ok(Self {
            channel,
            source: pattern.to_string(),
            pattern: compiled,
        })
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// 📜 The pattern exactly as it was configured.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// 🎯 Does this payload match? Undecodable payloads only match the empty pattern.
    pub fn matches(&self, payload: &[u8]) -> bool {
        if self.pattern.is_match_all() {
            return true;
        }
        match decode_payload_text(payload) {
            Ok(text) => self.pattern.matches_text(&text),
            Err(_) => false,
        }
    }
}

/// 📋 All subscription filters, keyed by channel. At most one per channel.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    by_channel: HashMap<ChannelId, SubscriptionFilter>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 🏗️ Compile every configured filter. First bad pattern or duplicate channel wins the error.
    pub fn from_config(configs: &[SubscriptionFilterConfig]) -> Result<Self, FilterSetError> {
        let mut set = Self::new();
        for config in configs {
            set.insert(SubscriptionFilter::new(
                config.channel.clone(),
                &config.pattern,
            )?)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, filter: SubscriptionFilter) -> Result<(), FilterSetError> {
        if self.by_channel.contains_key(filter.channel()) {
            return Err(FilterSetError::DuplicateChannel(filter.channel.clone()));
        }
        self.by_channel.insert(filter.channel.clone(), filter);
        Ok(())
    }

    pub fn filter_for(&self, channel: &ChannelId) -> Option<&SubscriptionFilter> {
        self.by_channel.get(channel)
    }

    pub fn len(&self) -> usize {
        self.by_channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }
}

/// 🚦 Should this record enter the pipeline?
///
/// No filter for the record's channel means yes. Otherwise the filter decides.
pub fn accept(record: &LogRecord, filters: &FilterSet) -> bool {
    match filters.filter_for(record.channel()) {
        None => true,
        Some(filter) => filter.matches(record.payload()),
    }
}
