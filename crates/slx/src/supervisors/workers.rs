//! 🧵 Workers: the ones who actually do the work while the Supervisor takes all the
//! credit in the sprint retro.
//!
//! One lane per source channel, three kinds of worker, two bounded queues:
//!
//! ```text
//! SourceWorker ──(LogRecord)──▶ BufferWorker ──(Batch)──▶ DeliveryWorker
//!   filter + route               size / interval            transform → frame →
//!                                flush                      deliver → maybe backup
//! ```
//!
//! ⚠️ A full queue makes the upstream worker wait. That is the backpressure. A slow
//! endpoint stalls its own lane and nobody else's.

use anyhow::Result;
use tokio::task::JoinHandle;

mod buffer_worker;
mod delivery_worker;
mod source_worker;

pub(super) use buffer_worker::BufferWorker;
pub(super) use delivery_worker::{DeliveryStage, DeliveryWorker};
pub(super) use source_worker::SourceWorker;

/// 🏗️ A background worker, that does work. duh.
///
/// "What's the DEAL with lifetime annotations? You borrow something,
///  you give it back. It's not that hard, Jerry!" (Seinfeld, on Rust)
pub(crate) trait Worker {
    fn start(self) -> JoinHandle<Result<()>>;
}
