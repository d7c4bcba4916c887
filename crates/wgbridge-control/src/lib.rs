//! wgbridge host-side control plane
//!
//! Applies validated configurations to live WireGuard interfaces with
//! rollback, owns the node's exchange and signing keys, and moves
//! configurations between nodes as signed, sealed bundles.

#![warn(missing_docs)]

pub mod apply;
pub mod audit;
pub mod bundle;
pub mod error;
pub mod export;
pub mod fsutil;
pub mod ingest;
pub mod keyring;
pub mod lock;
pub mod logging;
pub mod service;
pub mod settings;
pub mod watch;
pub mod wg;

#[cfg(test)]
mod testutil;

// Re-exports
pub use apply::{ApplyEngine, ApplyReport, ApplyStep};
pub use audit::{AuditConfig, AuditLogger, EventAction, EventCategory, EventOutcome};
pub use error::{ControlError, ControlResult};
pub use export::{ExportReport, Exporter};
pub use ingest::{InboxBundleStatus, IngestOutcome, IngestPipeline, IngestReport, IngestStage};
pub use keyring::{Keyring, RotationReport};
pub use lock::InterfaceLock;
pub use logging::{init_logging, LogConfig, LogFormat};
pub use service::ControlPlane;
pub use settings::{Settings, DEFAULT_SETTINGS_PATH};
pub use watch::InboxWatcher;
pub use wg::{InterfaceControl, LiveState, WgTool};
