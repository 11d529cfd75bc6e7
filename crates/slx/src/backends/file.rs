//! 📂 Previously, on "Things That Could Go Wrong With A File"...
//!
//! The disk was quiet. Too quiet. One process read log lines from it, one line per
//! record. Another wrote failed batches back to it, one object per batch, each one
//! landing atomically or not at all. Neither of them trusted the disk. Both were right.
//!
//! 🚰 FileSource: BufReader → lines → (plain | base64) → LogRecord
//! 🗄️ FileBackupStore: key → `<directory>/<key>`, written to a `.partial` file, then renamed
//! 💀 Disk full → an `Err` with a very specific context message
//! 🦆 (mandatory, no notes)

mod file_backup;
mod file_source;

pub(crate) use file_backup::FileBackupStore;
pub use file_backup::FileBackupConfig;
pub(crate) use file_source::FileSource;
pub use file_source::{FileSourceConfig, RecordEncoding};
