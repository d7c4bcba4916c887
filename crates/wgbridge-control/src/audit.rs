//! Structured audit logging
//!
//! Every mutating control operation emits one JSON record per line
//! (NDJSON) with at least an action and an outcome. Records are redacted
//! before they leave the process: any object field whose name contains
//! `key`, `password`, `secret` or `psk` (case-insensitive), at any depth,
//! is replaced with [`REDACTED`].
//!
//! # Configuration
//!
//! ```toml
//! [audit]
//! enabled = true
//! path = "/var/log/wgbridge/audit.jsonl"
//! max_size_mb = 100
//! rotate_count = 10
//! events = ["apply", "exchange"]   # empty = all
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Placeholder written in place of sensitive values
pub const REDACTED: &str = "<redacted>";

const SENSITIVE_PATTERNS: [&str; 4] = ["key", "password", "secret", "psk"];

// ─── Event Types ─────────────────────────────────────────────────────────────

/// Audit event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Configuration apply transactions
    Apply,
    /// Key generation and rotation
    KeyManagement,
    /// Bundle ingest and export
    Exchange,
    /// Service lifecycle
    System,
}

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    /// An apply transaction began
    ApplyStarted,
    /// An apply transaction committed
    ApplyCommitted,
    /// An apply step failed
    ApplyFailed,
    /// A failed apply was rolled back to the previous configuration
    ApplyRolledBack,
    /// Rolling back a failed apply itself failed
    RollbackFailed,

    /// Missing key material was generated
    KeysGenerated,
    /// Key material was rotated
    KeysRotated,

    /// A bundle passed every check and was staged to pending
    BundleReady,
    /// A bundle failed a check and was left in the inbox
    BundleRejected,
    /// A bundle was written to the outbox
    BundleExported,
    /// An export attempt failed and its partial output was removed
    ExportFailed,

    /// The inbox watcher started
    WatchStarted,
    /// The inbox watcher stopped
    WatchStopped,
}

/// Outcome of the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// The action completed successfully
    Success,
    /// The action failed and state was left consistent
    Failure,
    /// The input was refused by a trust check
    Denied,
    /// The action failed and consistency could not be guaranteed
    Error,
}

/// A single audit event record (one line of NDJSON)
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// RFC 3339 UTC timestamp
    pub timestamp: String,
    /// Unique event ID (monotonically increasing per process)
    pub event_id: u64,
    /// Event category
    pub category: EventCategory,
    /// Action tag
    pub action: EventAction,
    /// Outcome
    pub outcome: EventOutcome,
    /// Interface the action concerned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Apply step at which the event was raised
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Payload checksum known at the time of the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Fingerprint of the signer involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
    /// Bundle file involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<String>,
    /// Rotation token for key rotations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<String>,
    /// User on whose behalf the action ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Human-readable description
    pub message: String,
    /// Reason for failure/denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Free-form structured detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Host name
    pub hostname: String,
    /// wgbridge version
    pub version: String,
}

// ─── Redaction ───────────────────────────────────────────────────────────────

fn is_sensitive(field: &str) -> bool {
    let lower = field.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Replace the value of every sensitive field, recursively
pub fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (field, v) in map.iter_mut() {
                if is_sensitive(field) {
                    *v = Value::String(REDACTED.to_string());
                } else {
                    redact(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

// ─── Audit Logger ────────────────────────────────────────────────────────────

/// Configuration for the audit logger
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Whether audit logging is enabled
    pub enabled: bool,
    /// Path to the audit log file (NDJSON format)
    pub path: PathBuf,
    /// Maximum size in bytes before rotation
    pub max_size_bytes: u64,
    /// Number of rotated log files to keep
    pub rotate_count: u32,
    /// Which event categories to log (empty = all)
    pub categories: Vec<EventCategory>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("/var/log/wgbridge/audit.jsonl"),
            max_size_bytes: 100 * 1024 * 1024, // 100 MB
            rotate_count: 10,
            categories: Vec::new(),
        }
    }
}

/// Thread-safe audit logger
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<AuditLoggerInner>,
}

struct AuditLoggerInner {
    config: AuditConfig,
    file: Mutex<Option<File>>,
    event_counter: AtomicU64,
    hostname: String,
    actor: Option<String>,
}

impl AuditLogger {
    /// Create a new audit logger
    pub fn new(config: AuditConfig) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let actor = std::env::var("SUDO_USER")
            .or_else(|_| std::env::var("USER"))
            .ok()
            .filter(|u| !u.is_empty());

        let file = if config.enabled {
            if let Some(parent) = config.path.parent() {
                let _ = fs::create_dir_all(parent);
            }

            match open_log(&config.path) {
                Ok(f) => {
                    tracing::info!("Audit log opened: {}", config.path.display());
                    Some(f)
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to open audit log {}: {}; audit records go to tracing only",
                        config.path.display(),
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        Self {
            inner: Arc::new(AuditLoggerInner {
                config,
                file: Mutex::new(file),
                event_counter: AtomicU64::new(1),
                hostname,
                actor,
            }),
        }
    }

    /// Create a disabled audit logger (no-op)
    pub fn disabled() -> Self {
        Self::new(AuditConfig::default())
    }

    /// Check if audit logging is enabled
    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Log an audit event. Returns immediately if disabled or if the
    /// event category is filtered out.
    pub fn log(&self, event: AuditEvent) {
        if event.outcome == EventOutcome::Error {
            tracing::error!(
                audit_action = ?event.action,
                interface = ?event.interface,
                reason = ?event.reason,
                "{}",
                event.message
            );
        }

        if !self.inner.config.enabled {
            return;
        }

        if !self.inner.config.categories.is_empty()
            && !self.inner.config.categories.contains(&event.category)
        {
            return;
        }

        let mut value = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        redact(&mut value);
        let json = value.to_string();

        let mut guard = match self.inner.file.lock() {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!("Audit log lock poisoned: {}", e);
                return;
            }
        };

        if let Some(ref mut file) = *guard {
            if writeln!(file, "{}", json).is_err() {
                tracing::warn!("Failed to write audit event");
            }

            if let Ok(meta) = file.metadata() {
                if meta.len() > self.inner.config.max_size_bytes {
                    drop(guard); // release lock before rotating
                    self.rotate_log();
                }
            }
        }

        tracing::debug!(
            audit_category = ?event.category,
            audit_action = ?event.action,
            audit_outcome = ?event.outcome,
            interface = ?event.interface,
            "{}",
            event.message
        );
    }

    /// Build an event with common fields pre-filled
    pub fn build_event(
        &self,
        category: EventCategory,
        action: EventAction,
        outcome: EventOutcome,
        message: impl Into<String>,
    ) -> AuditEvent {
        let id = self.inner.event_counter.fetch_add(1, Ordering::Relaxed);
        let timestamp = humantime::format_rfc3339_millis(SystemTime::now()).to_string();

        AuditEvent {
            timestamp,
            event_id: id,
            category,
            action,
            outcome,
            interface: None,
            step: None,
            checksum: None,
            signer: None,
            bundle: None,
            rotation: None,
            actor: self.inner.actor.clone(),
            message: message.into(),
            reason: None,
            details: None,
            hostname: self.inner.hostname.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    // ─── Convenience methods ─────────────────────────────────────────────

    /// Log an apply transaction event
    pub fn log_apply(
        &self,
        interface: &str,
        action: EventAction,
        outcome: EventOutcome,
        step: Option<&str>,
        checksum: Option<&str>,
        reason: Option<String>,
    ) {
        let message = match (&action, step) {
            (EventAction::ApplyStarted, _) => format!("Apply started on {}", interface),
            (EventAction::ApplyCommitted, _) => format!("Apply committed on {}", interface),
            (EventAction::ApplyRolledBack, Some(step)) => {
                format!("Apply on {} rolled back after {} failure", interface, step)
            }
            (EventAction::RollbackFailed, _) => format!(
                "Rollback on {} FAILED; live state and disk may disagree",
                interface
            ),
            (_, Some(step)) => format!("Apply on {} failed at {}", interface, step),
            (_, None) => format!("Apply on {}: {:?}", interface, action),
        };

        let mut ev = self.build_event(EventCategory::Apply, action, outcome, message);
        ev.interface = Some(interface.to_string());
        ev.step = step.map(String::from);
        ev.checksum = checksum.map(String::from);
        ev.reason = reason;
        self.log(ev);
    }

    /// Log key generation (only called when something was generated)
    pub fn log_keys_generated(&self, generated: &[&str], signer: &str) {
        let mut ev = self.build_event(
            EventCategory::KeyManagement,
            EventAction::KeysGenerated,
            EventOutcome::Success,
            format!("Generated key material: {}", generated.join(", ")),
        );
        ev.signer = Some(signer.to_string());
        self.log(ev);
    }

    /// Log a completed key rotation
    pub fn log_keys_rotated(&self, rotation: &str, signer: &str, reencrypted: usize, skipped: usize) {
        let mut ev = self.build_event(
            EventCategory::KeyManagement,
            EventAction::KeysRotated,
            EventOutcome::Success,
            format!(
                "Keys rotated ({} inbox bundles re-encrypted, {} skipped)",
                reencrypted, skipped
            ),
        );
        ev.rotation = Some(rotation.to_string());
        ev.signer = Some(signer.to_string());
        ev.details = Some(serde_json::json!({
            "reencrypted": reencrypted,
            "skipped": skipped,
        }));
        self.log(ev);
    }

    /// Log a bundle exchange event
    #[allow(clippy::too_many_arguments)]
    pub fn log_exchange(
        &self,
        action: EventAction,
        outcome: EventOutcome,
        interface: Option<&str>,
        bundle: &str,
        checksum: Option<&str>,
        signer: Option<&str>,
        reason: Option<String>,
    ) {
        let message = match action {
            EventAction::BundleReady => format!("Bundle {} staged to pending", bundle),
            EventAction::BundleRejected => format!("Bundle {} rejected", bundle),
            EventAction::BundleExported => format!("Bundle {} exported", bundle),
            EventAction::ExportFailed => format!("Export of {} failed", bundle),
            other => format!("Bundle {}: {:?}", bundle, other),
        };

        let mut ev = self.build_event(EventCategory::Exchange, action, outcome, message);
        ev.interface = interface.map(String::from);
        ev.bundle = Some(bundle.to_string());
        ev.checksum = checksum.map(String::from);
        ev.signer = signer.map(String::from);
        ev.reason = reason;
        self.log(ev);
    }

    /// Log a service lifecycle event
    pub fn log_system(&self, action: EventAction, detail: &str) {
        let ev = self.build_event(EventCategory::System, action, EventOutcome::Success, detail);
        self.log(ev);
    }

    // ─── Log rotation ────────────────────────────────────────────────────

    fn rotate_log(&self) {
        let path = &self.inner.config.path;
        let count = self.inner.config.rotate_count;

        // Rotate: audit.jsonl.9 -> audit.jsonl.10, ... audit.jsonl -> audit.jsonl.1
        for i in (1..count).rev() {
            let from = format!("{}.{}", path.display(), i);
            let to = format!("{}.{}", path.display(), i + 1);
            let _ = fs::rename(&from, &to);
        }

        let rotated = format!("{}.1", path.display());
        let _ = fs::rename(path, &rotated);

        match self.inner.file.lock() {
            Ok(mut guard) => *guard = open_log(path).ok(),
            Err(e) => {
                tracing::warn!("Audit log lock poisoned during rotation: {}", e);
                return;
            }
        }

        tracing::info!("Audit log rotated: {} -> {}", path.display(), rotated);
    }
}

#[cfg(unix)]
fn open_log(path: &std::path::Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_log(path: &std::path::Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
