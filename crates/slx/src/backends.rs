//! 🔌 Backends: where the real I/O happens.
//!
//! 🚰 Sources pour records in, the Endpoint carries batches out, the Backup Store
//! catches whatever the endpoint would not take. And in between, we panic! (kidding, we use anyhow)
//!
//! 🎭 This module is the casting agency:
//!
//! | Trait | Concrete | What it talks to |
//! |---|---|---|
//! | [`Source`] | `FileSource`, `InMemorySource` | a file of lines, a Vec in RAM |
//! | [`Endpoint`] | `HecEndpoint`, `InMemoryEndpoint` | an HTTP event collector, a scripted fake |
//! | [`BackupStore`] | `FileBackupStore`, `InMemoryBackupStore` | a directory tree, a BTreeMap |
//!
//! Each trait gets an enum dispatcher (`SourceBackend`, `EndpointBackend`,
//! `BackupStoreBackend`) so the workers never see a `dyn`.
//!
//! 🦆 The duck is here because every file must have one. This is law. Do not question the duck.

use anyhow::Result;
use async_trait::async_trait;

use crate::common::LogRecord;
use crate::delivery::{DeliveryOutcome, DeliveryRequest};

pub(crate) mod file;
pub(crate) mod hec;
pub(crate) mod in_mem;

pub use file::{FileBackupConfig, FileSourceConfig, RecordEncoding};
pub use hec::{HecEndpointConfig, IndexerAckConfig};
pub use in_mem::InMemorySourceConfig;

// ===== Source =====

/// 🚰 A source of log records.
///
/// # Contract
/// - `next_record` yields records until the well runs dry, then `Ok(None)` forever after.
/// - `Err` is reserved for the source itself breaking (file vanished, disk said no).
///   A single unreadable record is skipped and logged, not an error.
#[async_trait]
pub(crate) trait Source: std::fmt::Debug + Send {
    async fn next_record(&mut self) -> Result<Option<LogRecord>>;
}

#[derive(Debug)]
pub(crate) enum SourceBackend {
    File(file::FileSource),
    InMemory(in_mem::InMemorySource),
}

#[async_trait]
impl Source for SourceBackend {
    async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        match self {
            SourceBackend::File(f) => f.next_record().await,
            SourceBackend::InMemory(i) => i.next_record().await,
        }
    }
}

// ===== Endpoint =====

/// 📡 The ingestion endpoint. One call = one attempt; the caller owns the timeout and the retries.
///
/// Never returns `Err`: every way an attempt can go wrong is a [`DeliveryOutcome`].
#[async_trait]
pub(crate) trait Endpoint: std::fmt::Debug + Send + Sync {
    async fn dispatch(&self, request: &DeliveryRequest) -> DeliveryOutcome;
}

/// 🎭 Cloneable so every lane can hold one. Clones share the connection pool (or the fake's log).
#[derive(Debug, Clone)]
pub(crate) enum EndpointBackend {
    Hec(hec::HecEndpoint),
    InMemory(in_mem::InMemoryEndpoint),
}

#[async_trait]
impl Endpoint for EndpointBackend {
    async fn dispatch(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        match self {
            EndpointBackend::Hec(e) => e.dispatch(request).await,
            EndpointBackend::InMemory(e) => e.dispatch(request).await,
        }
    }
}

// ===== Backup Store =====

/// 🗄️ What a successful `put` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutOutcome {
    Written,
    /// 🪞 the key was already there; one logical copy is all we promise
    AlreadyPresent,
}

/// 🗄️ Durable key → bytes storage. Keys are unique per (channel, sequence), writes are atomic.
#[async_trait]
pub(crate) trait BackupStore: std::fmt::Debug + Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<PutOutcome>;
}

#[derive(Debug, Clone)]
pub(crate) enum BackupStoreBackend {
    File(file::FileBackupStore),
    InMemory(in_mem::InMemoryBackupStore),
}

#[async_trait]
impl BackupStore for BackupStoreBackend {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<PutOutcome> {
        match self {
            BackupStoreBackend::File(s) => s.put(key, bytes).await,
            BackupStoreBackend::InMemory(s) => s.put(key, bytes).await,
        }
    }
}
