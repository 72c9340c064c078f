//! # statekeeper
//!
//! Durable backup, versioning and recovery for JSON project-state files.
//!
//! ## Overview
//!
//! State files are written crash-safely through [`integrity::AtomicWriter`], committed as
//! versioned snapshots by [`versioning::StateVersionManager`], and copied into a checksummed,
//! retention-governed backup store by [`backup::BackupManager`]. When corruption is detected the
//! [`recovery::RecoveryEngine`] searches version history for recovery points, builds a risk-scored
//! plan for one of four strategies and executes it, falling back to the backup store when no
//! history is available.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use statekeeper::{StateKeeper, StateKeeperConfig};
//! use statekeeper::recovery::RecoveryOptions;
//! use serde_json::json;
//! use std::path::PathBuf;
//!
//! # async fn example() -> statekeeper::Result<()> {
//! let keeper = StateKeeper::open("./project", StateKeeperConfig::default()).await?;
//! keeper.write_state("state.json", &json!({"epics": []})).await?;
//!
//! let report = keeper.recovery().auto_recover(
//!     &[PathBuf::from("state.json")],
//!     &RecoveryOptions::default(),
//! ).await?;
//! println!("recovered: {}", report.success);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`integrity`]: checksums, atomic writes and corruption scanning
//! - [`vcs`]: version-control primitives (git process wrapper and in-memory fake)
//! - [`backup`]: backup catalog, retention and restore
//! - [`versioning`]: templated state commits and recovery points
//! - [`recovery`]: recovery planning and execution
//! - [`config`]: configuration documents
//! - [`metrics`]: Prometheus metrics

#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

pub mod backup;
pub mod config;
pub mod integrity;
pub mod keeper;
pub mod metrics;
pub mod recovery;
pub mod telemetry;
pub mod vcs;
pub mod versioning;

pub use config::{BackupConfig, ConfigError, GitConfig, StateKeeperConfig};
pub use keeper::StateKeeper;

/// Result type for statekeeper operations
pub type Result<T> = std::result::Result<T, StateKeeperError>;

/// Main error type for statekeeper operations
#[derive(Error, Debug)]
pub enum StateKeeperError {
    /// Checksum, atomic write or scan failure
    #[error("Integrity error: {0}")]
    Integrity(#[from] integrity::IntegrityError),

    /// Version-control command failure
    #[error("Version control error: {0}")]
    Vcs(#[from] vcs::VcsError),

    /// Backup store failure
    #[error("Backup error: {0}")]
    Backup(#[from] backup::BackupError),

    /// State versioning failure
    #[error("Versioning error: {0}")]
    Version(#[from] versioning::VersionError),

    /// Recovery planning or execution failure
    #[error("Recovery error: {0}")]
    Recovery(#[from] recovery::RecoveryError),

    /// Configuration loading or validation failure
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
