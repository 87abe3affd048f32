//! # folder_vault
//!
//! Incremental, optionally encrypted folder backups that run by themselves once a watched
//! directory goes quiet.
//!
//! ## Features
//!
//! - **Incremental Backups**: SHA-256 change detection, only new or modified files are archived
//! - **Encryption**: Per-file AES-256 inside standard zip archives
//! - **Debounced Watching**: A directory is backed up once after it stops changing
//! - **Safe Restores**: Archives are fully verified before anything is extracted
//! - **Snapshot Restore**: Replays the archive history to rebuild the latest state
//!
//! ## Quick Start
//!
//! ```no_run
//! use folder_vault::backup::backup_config::BackupConfig;
//! use folder_vault::backup::service::BackupService;
//!
//! let config = BackupConfig::load("backup_config.json")?;
//! let service = BackupService::new(config)?;
//!
//! // Back up every configured directory once, then watch them.
//! for pair in service.config().directories.clone() {
//!     service.backup_configured(&pair.source)?;
//! }
//! let handle = service.start_watch(service.default_watch_directories()?)?;
//! service.stop_watch(handle);
//! # Ok::<(), folder_vault::backup::result_error::error::Error>(())
//! ```

pub mod backup;
