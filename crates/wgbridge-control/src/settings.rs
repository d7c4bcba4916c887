//! Control plane settings
//!
//! ```toml
//! [paths]
//! config_dir = "/etc/wireguard"
//! inbox_dir = "/var/lib/wgbridge/inbox"
//!
//! [apply]
//! strict = true
//! lock_timeout_secs = 30
//!
//! [exchange]
//! workers = 4
//!
//! [logging]
//! level = "info"
//! format = "compact"
//!
//! [audit]
//! enabled = true
//! path = "/var/log/wgbridge/audit.jsonl"
//! ```

use crate::audit::{AuditConfig, EventCategory};
use crate::error::{ControlError, ControlResult};
use crate::logging::LogFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file location
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/wgbridge/wgbridge.toml";

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Filesystem layout
    #[serde(default)]
    pub paths: PathSettings,

    /// Apply engine behaviour
    #[serde(default)]
    pub apply: ApplySettings,

    /// Bundle exchange behaviour
    #[serde(default)]
    pub exchange: ExchangeSettings,

    /// Diagnostic logging
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Audit logging
    #[serde(default)]
    pub audit: AuditSettings,
}

/// Directories the control plane owns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Live configuration directory (one `<iface>.conf` per interface)
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Per-interface lock files
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    /// Exchange and signing key material
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,

    /// Trusted signer list (one base64 Ed25519 public key per line)
    #[serde(default = "default_trusted_signers")]
    pub trusted_signers: PathBuf,

    /// Incoming bundles
    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: PathBuf,

    /// Verified, unapplied configurations
    #[serde(default = "default_pending_dir")]
    pub pending_dir: PathBuf,

    /// Exported bundles
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/wireguard")
}
fn default_lock_dir() -> PathBuf {
    PathBuf::from("/run/wgbridge/locks")
}
fn default_key_dir() -> PathBuf {
    PathBuf::from("/etc/wgbridge/keys")
}
fn default_trusted_signers() -> PathBuf {
    PathBuf::from("/etc/wgbridge/trusted_signers")
}
fn default_inbox_dir() -> PathBuf {
    PathBuf::from("/var/lib/wgbridge/inbox")
}
fn default_pending_dir() -> PathBuf {
    PathBuf::from("/var/lib/wgbridge/pending")
}
fn default_outbox_dir() -> PathBuf {
    PathBuf::from("/var/lib/wgbridge/outbox")
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            lock_dir: default_lock_dir(),
            key_dir: default_key_dir(),
            trusted_signers: default_trusted_signers(),
            inbox_dir: default_inbox_dir(),
            pending_dir: default_pending_dir(),
            outbox_dir: default_outbox_dir(),
        }
    }
}

impl PathSettings {
    /// Every path rooted under `root`, for tests and non-system installs
    pub fn under(root: &Path) -> Self {
        Self {
            config_dir: root.join("wireguard"),
            lock_dir: root.join("locks"),
            key_dir: root.join("keys"),
            trusted_signers: root.join("trusted_signers"),
            inbox_dir: root.join("inbox"),
            pending_dir: root.join("pending"),
            outbox_dir: root.join("outbox"),
        }
    }

    fn all(&self) -> [(&'static str, &Path); 7] {
        [
            ("config_dir", &self.config_dir),
            ("lock_dir", &self.lock_dir),
            ("key_dir", &self.key_dir),
            ("trusted_signers", &self.trusted_signers),
            ("inbox_dir", &self.inbox_dir),
            ("pending_dir", &self.pending_dir),
            ("outbox_dir", &self.outbox_dir),
        ]
    }
}

/// Apply engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplySettings {
    /// Refuse catch-all routes and require at least one peer
    #[serde(default = "default_true")]
    pub strict: bool,

    /// How long to wait for a busy interface lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Upper bound on each `wg` invocation
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// `wg` executable
    #[serde(default = "default_wg_binary")]
    pub wg_binary: String,
}

fn default_true() -> bool {
    true
}
fn default_lock_timeout() -> u64 {
    30
}
fn default_tool_timeout() -> u64 {
    15
}
fn default_wg_binary() -> String {
    "wg".to_string()
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            strict: true,
            lock_timeout_secs: default_lock_timeout(),
            tool_timeout_secs: default_tool_timeout(),
            wg_binary: default_wg_binary(),
        }
    }
}

impl ApplySettings {
    /// Lock acquisition window
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Per-invocation tool timeout
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// Bundle exchange settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSettings {
    /// Concurrent ingest workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bound manifest timestamps to the local clock
    #[serde(default = "default_true")]
    pub strict_manifest: bool,
}

fn default_workers() -> usize {
    4
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            strict_manifest: true,
        }
    }
}

/// Diagnostic logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, e.g. `info` or `wgbridge_control=debug`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `compact` or `pretty`
    #[serde(default)]
    pub format: LogFormat,

    /// Include source file and line in each event
    #[serde(default)]
    pub source_locations: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            source_locations: false,
        }
    }
}

/// Audit logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    /// Enable audit logging
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to audit log file (NDJSON format)
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,

    /// Maximum log file size in MB before rotation (default: 100)
    #[serde(default = "default_audit_max_mb")]
    pub max_size_mb: u64,

    /// Number of rotated files to keep (default: 10)
    #[serde(default = "default_rotate_count")]
    pub rotate_count: u32,

    /// Event categories to log (empty = all)
    /// Options: apply, key_management, exchange, system
    #[serde(default)]
    pub events: Vec<EventCategory>,
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("/var/log/wgbridge/audit.jsonl")
}
fn default_audit_max_mb() -> u64 {
    100
}
fn default_rotate_count() -> u32 {
    10
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_audit_path(),
            max_size_mb: default_audit_max_mb(),
            rotate_count: default_rotate_count(),
            events: Vec::new(),
        }
    }
}

impl AuditSettings {
    /// Logger configuration for these settings
    pub fn to_config(&self) -> AuditConfig {
        AuditConfig {
            enabled: self.enabled,
            path: self.path.clone(),
            max_size_bytes: self.max_size_mb.saturating_mul(1024 * 1024),
            rotate_count: self.rotate_count,
            categories: self.events.clone(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ControlResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ControlError::Settings(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_str(&content)
    }

    /// Parse settings from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ControlResult<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| ControlError::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> ControlResult<()> {
        for (name, path) in self.paths.all() {
            if !path.is_absolute() {
                return Err(ControlError::Settings(format!(
                    "paths.{} must be absolute: {}",
                    name,
                    path.display()
                )));
            }
        }
        if self.apply.lock_timeout_secs == 0 {
            return Err(ControlError::Settings(
                "apply.lock_timeout_secs must be positive".into(),
            ));
        }
        if self.apply.tool_timeout_secs == 0 {
            return Err(ControlError::Settings(
                "apply.tool_timeout_secs must be positive".into(),
            ));
        }
        if self.apply.wg_binary.trim().is_empty() {
            return Err(ControlError::Settings("apply.wg_binary is empty".into()));
        }
        if let Err(e) = tracing_subscriber::EnvFilter::try_new(&self.logging.level) {
            return Err(ControlError::Settings(format!(
                "logging.level {:?}: {}",
                self.logging.level, e
            )));
        }
        if self.exchange.workers == 0 {
            return Err(ControlError::Settings(
                "exchange.workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Settings with every directory under `root` and audit to
    /// `root/audit.jsonl`
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            paths: PathSettings::under(root),
            audit: AuditSettings {
                path: root.join("audit.jsonl"),
                ..AuditSettings::default()
            },
            ..Settings::default()
        }
    }
}
