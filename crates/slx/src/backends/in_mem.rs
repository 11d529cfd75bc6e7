//! # Previously, on Sluice...
//!
//! 🎬 The logs were real. The endpoint was not. Somewhere in RAM, a fake
//! collector nodded at every request, or hung forever, or said 503, exactly as
//! the test script told it to. It was the best actor we ever hired.
//!
//! `in_mem` provides the RAM-only trio:
//! - [`InMemorySource`]: a fixed list of lines for one channel, yielded once
//! - [`InMemoryEndpoint`]: acks everything; in tests it replays a script of replies
//!   and keeps every request it received
//! - [`InMemoryBackupStore`]: a `BTreeMap` of key → bytes, with optional injected failures
//!
//! Everything shareable sits behind `Arc<tokio::sync::Mutex<...>>` so tests can keep
//! a clone and peek after handing the original to the pipeline.
//!
//! ⚠️ This is NOT for production. If you're deploying this to prod, please also
//! deploy a therapist. 🦆

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::backends::{BackupStore, Endpoint, PutOutcome, Source};
use crate::common::{ChannelId, LogRecord};
use crate::delivery::{DeliveryOutcome, DeliveryRequest};

/// 🔧 `[[sources]]` + `[sources.InMemory]`: lines typed straight into the config.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct InMemorySourceConfig {
    pub channel: ChannelId,
    #[serde(default)]
    pub records: Vec<String>,
}

/// 📦 The world's most optimistic source. Gives you its lines once, then nothing, forever.
#[derive(Debug)]
pub(crate) struct InMemorySource {
    channel: ChannelId,
    pending: VecDeque<Vec<u8>>,
}

impl InMemorySource {
    pub(crate) fn new(config: InMemorySourceConfig) -> Self {
        Self {
            channel: config.channel,
            pending: config.records.into_iter().map(String::into_bytes).collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_payloads(channel: ChannelId, payloads: Vec<Vec<u8>>) -> Self {
        Self {
            channel,
            pending: payloads.into(),
        }
    }
}

#[async_trait]
impl Source for InMemorySource {
    async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        Ok(self
            .pending
            .pop_front()
            .map(|payload| LogRecord::arriving_now(self.channel.clone(), payload)))
    }
}

/// 🎬 One line of the fake endpoint's script.
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) enum ScriptedReply {
    Outcome(DeliveryOutcome),
    /// 🥶 never answer; the ack timeout has to save us
    Hang,
}

/// 🎭 A pretend collector. Outside of tests it acks everything; tests hand it a script,
/// consumed in order, and it acks once the script runs out.
#[derive(Debug, Clone, Default)]
pub(crate) struct InMemoryEndpoint {
    #[cfg(test)]
    script: Arc<Mutex<VecDeque<ScriptedReply>>>,
    #[cfg(test)]
    received: Arc<Mutex<Vec<DeliveryRequest>>>,
}

#[cfg(test)]
impl InMemoryEndpoint {
    pub(crate) fn scripted(replies: Vec<ScriptedReply>) -> Self {
        Self {
            script: Arc::new(Mutex::new(replies.into())),
            received: Arc::default(),
        }
    }

    /// 🔍 Every request that reached us, including the ones we ignored.
    pub(crate) async fn received(&self) -> Vec<DeliveryRequest> {
        self.received.lock().await.clone()
    }

    async fn reply_to(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        self.received.lock().await.push(request.clone());
        let reply = self.script.lock().await.pop_front();
        match reply {
            None => DeliveryOutcome::Acked,
            Some(ScriptedReply::Outcome(outcome)) => outcome,
            Some(ScriptedReply::Hang) => std::future::pending().await,
        }
    }
}

#[cfg(not(test))]
impl InMemoryEndpoint {
    async fn reply_to(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        tracing::trace!(
            "🎭 pretending to deliver {}#{} ({} events)",
            request.channel, request.sequence, request.event_count
        );
        DeliveryOutcome::Acked
    }
}

#[async_trait]
impl Endpoint for InMemoryEndpoint {
    async fn dispatch(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        self.reply_to(request).await
    }
}

/// 🗄️ A backup store with the durability of a goldfish and the honesty of a witness.
#[derive(Debug, Clone, Default)]
pub(crate) struct InMemoryBackupStore {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    failures_left: Arc<AtomicU32>,
    put_calls: Arc<AtomicU32>,
}

#[cfg(test)]
impl InMemoryBackupStore {
    /// 💥 The next `failures` puts fail, then it behaves.
    pub(crate) fn failing(failures: u32) -> Self {
        Self {
            failures_left: Arc::new(AtomicU32::new(failures)),
            ..Self::default()
        }
    }

    pub(crate) async fn objects(&self) -> BTreeMap<String, Vec<u8>> {
        self.objects.lock().await.clone()
    }

    pub(crate) fn put_calls(&self) -> u32 {
        self.put_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BackupStore for InMemoryBackupStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<PutOutcome> {
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            bail!("💀 injected backup failure for '{key}'. The goldfish forgot.");
        }

        let mut objects = self.objects.lock().await;
        if let Some(existing) = objects.get(key) {
            if existing.as_slice() != bytes {
                bail!("💀 backup key '{key}' already holds different bytes.");
            }
            return Ok(PutOutcome::AlreadyPresent);
        }
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(PutOutcome::Written)
    }
}
