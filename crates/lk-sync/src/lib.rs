//! Listkeeper Synchronization Library
//!
//! Network-facing layer on top of `lk-core`: the scheduled download engine
//! with expiration and retry handling, the subscription synchronizer that
//! turns fetched rule lists into graph updates, application update checks,
//! and the runtime configuration file.
//!
//! # Modules
//!
//! - `config`: JSON runtime configuration
//! - `downloader`: generic scheduled-download engine
//! - `synchronizer`: subscription content synchronization
//! - `updater`: application update checks

pub mod config;
pub mod downloader;
pub mod synchronizer;
pub mod updater;

// Re-export commonly used types
pub use config::Config;
pub use downloader::{
    DownloadClient, DownloadError, DownloadHandler, Downloadable, Downloader, DownloaderConfig,
    DownloadResponse, ReqwestClient, SuccessOutcome,
};
pub use synchronizer::{ChecksumFn, SyncCore, Synchronizer};
pub use updater::{UpdateCore, Updater, UpdateState};
