//! Atomic configuration apply
//!
//! One apply is a small transaction against `<config_dir>/<iface>.conf`
//! and the running interface:
//!
//! ```text
//! VALIDATE -> LOCK -> STAGE -> SWAP -> SYNC -> VERIFY -> COMMIT
//!                                        \        \
//!                                         +--------+--> ROLLBACK
//! ```
//!
//! Validation failures touch nothing. Once the live file has been swapped,
//! any failure restores the previous file from `.bak` and re-syncs the
//! interface from it, so disk and live state agree when `apply` returns.
//! With no previous file, the candidate is removed and the interface is
//! re-synced from its `[Interface]` section alone, dropping every peer the
//! candidate pushed.
//! A failure while restoring is reported as [`ControlError::RollbackFailed`].

use crate::audit::{AuditLogger, EventAction, EventOutcome};
use crate::error::{ControlError, ControlResult};
use crate::fsutil;
use crate::lock::InterfaceLock;
use crate::settings::{ApplySettings, PathSettings};
use crate::wg::{InterfaceControl, LiveState};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use wgbridge_protocol::{
    sha256_hex, validate_interface_name, ConfigSummary, ConfigValidator, Parser,
};

/// Stages of an apply transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStep {
    /// Parse and validate the candidate
    Validate,
    /// Take the interface lock
    Lock,
    /// Write the candidate next to the live file
    Stage,
    /// Move live to `.bak` and the candidate to live
    Swap,
    /// Push the new file into the running interface
    Sync,
    /// Compare live state with the candidate
    Verify,
    /// Drop the backup
    Commit,
}

impl ApplyStep {
    /// Lowercase step name used in audit records
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Lock => "lock",
            Self::Stage => "stage",
            Self::Swap => "swap",
            Self::Sync => "sync",
            Self::Verify => "verify",
            Self::Commit => "commit",
        }
    }
}

/// Result of a committed apply
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Interface name
    pub interface: String,
    /// SHA-256 of the applied text
    pub checksum: String,
    /// Number of peers applied
    pub peers: usize,
    /// Listen port applied, if any
    pub listen_port: Option<u16>,
    /// Whether a previous configuration was replaced
    pub replaced_existing: bool,
}

/// Applies validated configurations to live interfaces
#[derive(Clone)]
pub struct ApplyEngine {
    config_dir: PathBuf,
    lock_dir: PathBuf,
    lock_timeout: Duration,
    strict: bool,
    control: Arc<dyn InterfaceControl>,
    audit: AuditLogger,
}

impl ApplyEngine {
    /// Create an engine over the configured directories
    pub fn new(
        paths: &PathSettings,
        settings: &ApplySettings,
        control: Arc<dyn InterfaceControl>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            config_dir: paths.config_dir.clone(),
            lock_dir: paths.lock_dir.clone(),
            lock_timeout: settings.lock_timeout(),
            strict: settings.strict,
            control,
            audit,
        }
    }

    /// Path of the live configuration file for `interface`
    pub fn live_path(&self, interface: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", interface))
    }

    fn backup_path(&self, interface: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf.bak", interface))
    }

    /// Parse and validate `text` without touching anything
    pub fn validate(&self, interface: &str, text: &str) -> ControlResult<ConfigSummary> {
        validate_interface_name(interface)?;
        let summary = Parser::new(self.strict).parse(text)?;
        ConfigValidator::new(self.strict).validate(&summary)?;
        Ok(summary)
    }

    /// Apply `text` as the configuration of `interface`
    pub fn apply(&self, interface: &str, text: &str) -> ControlResult<ApplyReport> {
        if let Err(e) = validate_interface_name(interface) {
            tracing::warn!(error = %e, "apply refused: bad interface name");
            return Err(e.into());
        }
        let checksum = sha256_hex(text.as_bytes());

        self.audit.log_apply(
            interface,
            EventAction::ApplyStarted,
            EventOutcome::Success,
            None,
            Some(&checksum),
            None,
        );

        // VALIDATE
        let summary = match self.validate(interface, text) {
            Ok(s) => s,
            Err(e) => return Err(self.fail(interface, ApplyStep::Validate, &checksum, e)),
        };

        // LOCK
        let _lock = match InterfaceLock::acquire(&self.lock_dir, interface, self.lock_timeout) {
            Ok(lock) => lock,
            Err(e) => return Err(self.fail(interface, ApplyStep::Lock, &checksum, e)),
        };

        // STAGE
        let staged = match self.stage(interface, text) {
            Ok(path) => path,
            Err(e) => return Err(self.fail(interface, ApplyStep::Stage, &checksum, e.into())),
        };

        // SWAP
        let live = self.live_path(interface);
        let backup = self.backup_path(interface);
        let had_backup = match self.swap(interface, &staged, &live, &backup) {
            Ok(had_backup) => had_backup,
            Err(e) => return Err(self.fail(interface, ApplyStep::Swap, &checksum, e)),
        };

        // SYNC
        if let Err(e) = self.control.sync(interface, &live) {
            return Err(self.rollback(interface, ApplyStep::Sync, &checksum, &summary, had_backup, e));
        }

        // VERIFY
        let verified = self
            .control
            .live_state(interface)
            .and_then(|state| verify_live_state(&summary, &state));
        if let Err(e) = verified {
            return Err(self.rollback(interface, ApplyStep::Verify, &checksum, &summary, had_backup, e));
        }

        // COMMIT
        if had_backup {
            if let Err(e) = fsutil::remove_if_exists(&backup) {
                tracing::warn!(interface, error = %e, "failed to remove backup after commit");
            }
        }
        self.audit.log_apply(
            interface,
            EventAction::ApplyCommitted,
            EventOutcome::Success,
            Some(ApplyStep::Commit.as_str()),
            Some(&checksum),
            None,
        );
        tracing::info!(interface, peers = summary.peers.len(), "configuration applied");

        Ok(ApplyReport {
            interface: interface.to_string(),
            checksum,
            peers: summary.peers.len(),
            listen_port: summary.listen_port(),
            replaced_existing: had_backup,
        })
    }

    fn stage(&self, interface: &str, text: &str) -> io::Result<PathBuf> {
        if !self.config_dir.exists() {
            fsutil::ensure_private_dir(&self.config_dir)?;
        }
        fsutil::stage_file(&self.config_dir, interface, text.as_bytes())
    }

    /// Returns whether a previous live file was moved to `backup`
    fn swap(&self, interface: &str, staged: &Path, live: &Path, backup: &Path) -> ControlResult<bool> {
        let had_backup = match fs::rename(live, backup) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                let _ = fsutil::remove_if_exists(staged);
                return Err(e.into());
            }
        };

        if let Err(e) = fs::rename(staged, live) {
            let _ = fsutil::remove_if_exists(staged);
            if had_backup {
                if let Err(restore) = fs::rename(backup, live) {
                    return Err(ControlError::RollbackFailed {
                        interface: interface.to_string(),
                        detail: format!(
                            "restoring backup failed ({}) after swap failure ({})",
                            restore, e
                        ),
                    });
                }
            }
            return Err(e.into());
        }

        fsutil::sync_dir(&self.config_dir);
        Ok(had_backup)
    }

    /// Sync a transient file holding only the candidate's `[Interface]`
    /// section. Nothing is left on disk.
    fn sync_without_peers(&self, interface: &str, candidate: &ConfigSummary) -> ControlResult<()> {
        let text = render_interface_only(candidate);
        let staged = fsutil::stage_file(&self.config_dir, interface, text.as_bytes())?;
        let synced = self.control.sync(interface, &staged);
        if let Err(e) = fsutil::remove_if_exists(&staged) {
            tracing::warn!(interface, error = %e, "failed to remove transient config");
        }
        synced
    }

    fn fail(
        &self,
        interface: &str,
        step: ApplyStep,
        checksum: &str,
        err: ControlError,
    ) -> ControlError {
        let (action, outcome) = if err.is_fatal() {
            (EventAction::RollbackFailed, EventOutcome::Error)
        } else {
            (EventAction::ApplyFailed, EventOutcome::Failure)
        };
        tracing::warn!(interface, step = step.as_str(), error = %err, "apply failed");
        self.audit.log_apply(
            interface,
            action,
            outcome,
            Some(step.as_str()),
            Some(checksum),
            Some(err.to_string()),
        );
        err
    }

    fn rollback(
        &self,
        interface: &str,
        step: ApplyStep,
        checksum: &str,
        candidate: &ConfigSummary,
        had_backup: bool,
        cause: ControlError,
    ) -> ControlError {
        let cause = self.fail(interface, step, checksum, cause);
        let live = self.live_path(interface);
        let backup = self.backup_path(interface);

        let restored = (|| -> ControlResult<()> {
            fsutil::remove_if_exists(&live)?;
            if had_backup {
                fs::rename(&backup, &live)?;
                fsutil::sync_dir(&self.config_dir);
                self.control.sync(interface, &live)?;
            } else {
                tracing::warn!(
                    interface,
                    "no previous configuration to restore; clearing peers from the interface"
                );
                self.sync_without_peers(interface, candidate)?;
            }
            Ok(())
        })();

        match restored {
            Ok(()) => {
                tracing::warn!(interface, step = step.as_str(), "apply rolled back");
                self.audit.log_apply(
                    interface,
                    EventAction::ApplyRolledBack,
                    EventOutcome::Failure,
                    Some(step.as_str()),
                    Some(checksum),
                    Some(if had_backup {
                        cause.to_string()
                    } else {
                        format!("{} (no previous configuration existed)", cause)
                    }),
                );
                cause
            }
            Err(e) => {
                let fatal = ControlError::RollbackFailed {
                    interface: interface.to_string(),
                    detail: format!("{} (while recovering from: {})", e, cause),
                };
                self.audit.log_apply(
                    interface,
                    EventAction::RollbackFailed,
                    EventOutcome::Error,
                    Some(step.as_str()),
                    Some(checksum),
                    Some(fatal.to_string()),
                );
                fatal
            }
        }
    }
}

fn render_interface_only(summary: &ConfigSummary) -> String {
    let mut text = String::from("[Interface]\n");
    for (key, value) in &summary.interface {
        text.push_str(&format!("{} = {}\n", key, value));
    }
    text
}

/// Compare what the interface runs with what was applied
pub fn verify_live_state(expected: &ConfigSummary, live: &LiveState) -> ControlResult<()> {
    if let Some(port) = expected.listen_port() {
        if live.listen_port != Some(port) {
            return Err(ControlError::Verification(format!(
                "listen port mismatch: expected {}, interface reports {:?}",
                port, live.listen_port
            )));
        }
    }

    let wanted = expected.peer_public_keys();
    let missing: Vec<_> = wanted.difference(&live.peers).collect();
    let extra: Vec<_> = live.peers.difference(&wanted).collect();
    if !missing.is_empty() || !extra.is_empty() {
        return Err(ControlError::Verification(format!(
            "peer set mismatch: expected {} peers, interface has {} ({} missing, {} unexpected)",
            wanted.len(),
            live.peers.len(),
            missing.len(),
            extra.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{audit_actions, read_audit, sample_config, test_audit, FakeInterface};

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        fake: Arc<FakeInterface>,
        engine: ApplyEngine,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let fake = Arc::new(FakeInterface::new());
            let settings = ApplySettings {
                lock_timeout_secs: 2,
                ..ApplySettings::default()
            };
            let engine = ApplyEngine::new(
                &PathSettings::under(&root),
                &settings,
                fake.clone(),
                test_audit(&root.join("audit.jsonl")),
            );
            Self {
                _dir: dir,
                root,
                fake,
                engine,
            }
        }

        fn audit_path(&self) -> PathBuf {
            self.root.join("audit.jsonl")
        }

        fn config_dir(&self) -> PathBuf {
            self.root.join("wireguard")
        }
    }

    #[test]
    fn test_apply_fresh_interface() {
        let fx = Fixture::new();
        let text = sample_config(51820, &[2, 3]);

        let report = fx.engine.apply("wg0", &text).unwrap();
        assert_eq!(report.peers, 2);
        assert_eq!(report.listen_port, Some(51820));
        assert!(!report.replaced_existing);
        assert_eq!(report.checksum, sha256_hex(text.as_bytes()));

        assert_eq!(fs::read_to_string(fx.engine.live_path("wg0")).unwrap(), text);
        assert!(!fx.config_dir().join("wg0.conf.bak").exists());
        assert_eq!(fx.fake.live("wg0").peers.len(), 2);
        assert_eq!(
            audit_actions(&fx.audit_path()),
            vec!["apply_started", "apply_committed"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_live_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let fx = Fixture::new();
        fx.engine.apply("wg0", &sample_config(51820, &[2])).unwrap();
        let mode = fs::metadata(fx.engine.live_path("wg0")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_reapply_is_idempotent() {
        let fx = Fixture::new();
        let text = sample_config(51820, &[2, 3]);

        fx.engine.apply("wg0", &text).unwrap();
        let first = fx.fake.live("wg0");
        let report = fx.engine.apply("wg0", &text).unwrap();

        assert!(report.replaced_existing);
        assert_eq!(fx.fake.live("wg0"), first);
        assert_eq!(fs::read_to_string(fx.engine.live_path("wg0")).unwrap(), text);
        let actions = audit_actions(&fx.audit_path());
        assert!(!actions.iter().any(|a| a == "apply_rolled_back"));
        assert_eq!(actions.iter().filter(|a| *a == "apply_committed").count(), 2);
    }

    #[test]
    fn test_sync_failure_restores_previous_file() {
        let fx = Fixture::new();
        let old = sample_config(51820, &[2]);
        fx.engine.apply("wg0", &old).unwrap();
        let before = fs::read(fx.engine.live_path("wg0")).unwrap();

        fx.fake.fail_next_syncs(1);
        let new = sample_config(51821, &[2, 3]);
        let err = fx.engine.apply("wg0", &new).unwrap_err();
        assert!(matches!(err, ControlError::ExternalTool { .. }));

        assert_eq!(fs::read(fx.engine.live_path("wg0")).unwrap(), before);
        assert!(!fx.config_dir().join("wg0.conf.bak").exists());

        // initial apply, failed sync of the candidate, re-sync of the restored file
        let syncs = fx.fake.syncs();
        assert_eq!(syncs.len(), 3);
        assert_eq!(syncs[1].content, new);
        assert_eq!(syncs[2].content, old);
        assert_eq!(fx.fake.live("wg0").listen_port, Some(51820));

        let records = read_audit(&fx.audit_path());
        let rollback = records
            .iter()
            .find(|r| r["action"] == "apply_rolled_back")
            .expect("rollback record");
        assert_eq!(rollback["step"], "sync");
        assert_eq!(rollback["interface"], "wg0");
    }

    #[test]
    fn test_verify_mismatch_rolls_back() {
        let fx = Fixture::new();
        let old = sample_config(51820, &[2]);
        fx.engine.apply("wg0", &old).unwrap();

        fx.fake.drop_last_peer(true);
        let err = fx.engine.apply("wg0", &sample_config(51820, &[2, 3])).unwrap_err();
        assert!(matches!(err, ControlError::Verification(_)));
        assert_eq!(fs::read_to_string(fx.engine.live_path("wg0")).unwrap(), old);

        let records = read_audit(&fx.audit_path());
        assert!(records
            .iter()
            .any(|r| r["action"] == "apply_rolled_back" && r["step"] == "verify"));
    }

    #[test]
    fn test_failed_rollback_is_fatal() {
        let fx = Fixture::new();
        fx.engine.apply("wg0", &sample_config(51820, &[2])).unwrap();

        // candidate sync and the restoring re-sync both fail
        fx.fake.fail_next_syncs(2);
        let err = fx.engine.apply("wg0", &sample_config(51820, &[3])).unwrap_err();
        assert!(err.is_fatal());

        let records = read_audit(&fx.audit_path());
        let fatal = records
            .iter()
            .find(|r| r["action"] == "rollback_failed")
            .expect("fatal record");
        assert_eq!(fatal["outcome"], "error");
    }

    #[test]
    fn test_first_apply_sync_failure_leaves_no_file() {
        let fx = Fixture::new();
        fx.fake.fail_next_syncs(1);
        assert!(fx.engine.apply("wg0", &sample_config(51820, &[2])).is_err());
        assert!(!fx.engine.live_path("wg0").exists());

        // the failed candidate, then the peerless re-sync
        let syncs = fx.fake.syncs();
        assert_eq!(syncs.len(), 2);
        assert!(!syncs[1].content.contains("[Peer]"));
        assert!(fs::read_dir(fx.config_dir()).unwrap().next().is_none());
    }

    #[test]
    fn test_first_apply_verify_failure_clears_pushed_peers() {
        let fx = Fixture::new();
        fx.fake.drop_last_peer(true);
        let err = fx.engine.apply("wg0", &sample_config(51820, &[2, 3])).unwrap_err();
        assert_eq!(err.kind(), "verification");

        assert!(!fx.engine.live_path("wg0").exists());
        assert!(fx.fake.live("wg0").peers.is_empty());
        assert_eq!(fx.fake.live("wg0").listen_port, Some(51820));
        assert!(fs::read_dir(fx.config_dir()).unwrap().next().is_none());

        let records = read_audit(&fx.audit_path());
        assert!(records.iter().any(|r| r["action"] == "apply_rolled_back"));
    }

    #[test]
    fn test_sync_timeout_rolls_back() {
        let fx = Fixture::new();
        let old = sample_config(51820, &[2]);
        fx.engine.apply("wg0", &old).unwrap();
        let before = fs::read(fx.engine.live_path("wg0")).unwrap();

        fx.fake.time_out_next_syncs(1);
        let err = fx.engine.apply("wg0", &sample_config(51821, &[2, 3])).unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(!err.is_fatal());

        assert_eq!(fs::read(fx.engine.live_path("wg0")).unwrap(), before);
        let syncs = fx.fake.syncs();
        assert_eq!(syncs.len(), 3);
        assert_eq!(syncs[2].content, old);
        assert_eq!(fx.fake.live("wg0").listen_port, Some(51820));

        let records = read_audit(&fx.audit_path());
        assert!(records
            .iter()
            .any(|r| r["action"] == "apply_rolled_back" && r["step"] == "sync"));
    }

    #[test]
    fn test_live_state_timeout_rolls_back() {
        let fx = Fixture::new();
        let old = sample_config(51820, &[2]);
        fx.engine.apply("wg0", &old).unwrap();
        let before = fs::read(fx.engine.live_path("wg0")).unwrap();

        fx.fake.time_out_live_state(true);
        let err = fx.engine.apply("wg0", &sample_config(51820, &[2, 3])).unwrap_err();
        assert_eq!(err.kind(), "timeout");

        assert_eq!(fs::read(fx.engine.live_path("wg0")).unwrap(), before);
        let syncs = fx.fake.syncs();
        assert_eq!(syncs.last().unwrap().content, old);
        assert_eq!(fx.fake.live("wg0").peers.len(), 1);

        let records = read_audit(&fx.audit_path());
        assert!(records
            .iter()
            .any(|r| r["action"] == "apply_rolled_back" && r["step"] == "verify"));
    }

    #[test]
    fn test_validation_failure_has_no_side_effects() {
        let fx = Fixture::new();
        let err = fx.engine.apply("wg0", "[Interface]\nPrivateKey = nope\n").unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(!fx.config_dir().exists());
        assert!(fx.fake.syncs().is_empty());

        let conflicting = sample_config(51820, &[2]).replace("10.9.0.2/32", "10.9.0.0/24")
            + &format!("\n[Peer]\nPublicKey = {}\nAllowedIPs = 10.9.0.7/32\n", crate::testutil::wg_key(7));
        let err = fx.engine.apply("wg0", &conflicting).unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert!(fx.fake.syncs().is_empty());

        assert!(fx.engine.apply("../etc/passwd", &sample_config(1, &[2])).is_err());
    }

    #[test]
    fn test_lock_timeout_aborts_before_staging() {
        let fx = Fixture::new();
        let _held =
            InterfaceLock::acquire(&fx.root.join("locks"), "wg0", Duration::from_secs(1)).unwrap();

        let err = fx.engine.apply("wg0", &sample_config(51820, &[2])).unwrap_err();
        assert!(matches!(err, ControlError::LockTimeout { .. }));
        assert!(!fx.engine.live_path("wg0").exists());
    }

    #[test]
    fn test_concurrent_applies_to_one_interface_serialize() {
        let fx = Fixture::new();
        fx.fake.set_sync_delay(Duration::from_millis(50));

        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let engine = fx.engine.clone();
                std::thread::spawn(move || engine.apply("wg0", &sample_config(51820, &[2 + i])))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        assert_eq!(fx.fake.max_concurrent_syncs(), 1);
        // disk and live state agree on the last writer
        let on_disk = fs::read_to_string(fx.engine.live_path("wg0")).unwrap();
        let summary = Parser::new(false).parse(&on_disk).unwrap();
        assert_eq!(fx.fake.live("wg0").peers, summary.peer_public_keys());
    }

    #[test]
    fn test_verify_live_state() {
        let summary = Parser::new(false)
            .parse(&sample_config(51820, &[2, 3]))
            .unwrap();
        let mut live = LiveState {
            listen_port: Some(51820),
            peers: summary.peer_public_keys(),
        };
        assert!(verify_live_state(&summary, &live).is_ok());

        live.listen_port = Some(1);
        assert!(verify_live_state(&summary, &live).is_err());

        live.listen_port = Some(51820);
        live.peers.insert("extra".into());
        assert!(verify_live_state(&summary, &live).is_err());
    }
}
