//! 🚰 slx: the sluice. Log records in, filtered, batched, transformed, shipped to an
//! HTTP event collector, and backed up when the collector will not have them.
//!
//! ```text
//! Source ─▶ Filter ─▶ BufferingStream ─▶ Transformer ─▶ DeliveryClient ─▶ Endpoint
//!                                                            │
//!                                                            └──▶ BackupStore
//!                  everything above ──▶ OperationalLog
//! ```
//!
//! Load an [`app_config::AppConfig`], make a [`ShutdownTrigger`], call [`run`]. 🦆

pub mod app_config;
pub mod backends;
pub mod backup;
pub mod buffering;
pub mod common;
pub mod composers;
pub mod delivery;
pub mod filters;
pub mod oplog;
pub mod report;
pub mod transforms;
mod supervisors;

use anyhow::{Context, Result};

use crate::app_config::AppConfig;
use crate::oplog::OpLogSnapshot;
use crate::supervisors::Supervisor;
pub use crate::supervisors::shutdown::{ShutdownListener, ShutdownTrigger};

/// 🚀 Build the pipeline from `app_config` and run it until every source is exhausted
/// or `shutdown` fires and the lanes drain. Returns the final operational counters.
///
/// `Err` means the pipeline could not be built or a lane broke; bad records and failed
/// deliveries never surface here, they surface in the returned counters.
pub async fn run(app_config: AppConfig, shutdown: ShutdownListener) -> Result<OpLogSnapshot> {
    app_config.validate()?;
    let supervisor = Supervisor::from_config(&app_config)
        .await
        .context("💀 Failed to build the pipeline")?;
    supervisor.run(shutdown).await
}
