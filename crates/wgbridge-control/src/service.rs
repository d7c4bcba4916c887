//! Control plane service container
//!
//! [`ControlPlane`] wires the audit sink, keyring, apply engine, ingest
//! pipeline and exporter together from one [`Settings`] value. Nothing is
//! global: every collaborator is built here and handed to the components
//! that need it. The inbox watcher is the only long-running part and has
//! an explicit start/shutdown.

use crate::apply::{ApplyEngine, ApplyReport};
use crate::audit::AuditLogger;
use crate::error::{ControlError, ControlResult};
use crate::export::{ExportReport, Exporter};
use crate::ingest::{InboxBundleStatus, IngestPipeline, IngestReport};
use crate::keyring::{Keyring, RotationReport};
use crate::settings::Settings;
use crate::watch::InboxWatcher;
use crate::wg::{InterfaceControl, WgTool};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use wgbridge_protocol::{select_backend, ConfigSummary, ExchangeCrypto, ExchangePublicKey};

/// The control plane and its collaborators
pub struct ControlPlane {
    settings: Settings,
    audit: AuditLogger,
    keyring: Keyring,
    apply: ApplyEngine,
    ingest: IngestPipeline,
    exporter: Exporter,
    watcher: Option<InboxWatcher>,
}

impl ControlPlane {
    /// Build every component. Missing key material is generated.
    pub fn new(settings: Settings, control: Arc<dyn InterfaceControl>) -> ControlResult<Self> {
        settings.validate()?;

        let audit = AuditLogger::new(settings.audit.to_config());
        let backend: Arc<dyn ExchangeCrypto> = Arc::from(select_backend());
        tracing::debug!("Exchange crypto backend: {}", backend.name());

        let keyring = Keyring::new(&settings.paths, backend, audit.clone());
        keyring.ensure_keys()?;

        let apply = ApplyEngine::new(&settings.paths, &settings.apply, control, audit.clone());
        let ingest = IngestPipeline::new(
            &settings.paths,
            &settings.exchange,
            keyring.clone(),
            audit.clone(),
        );
        let exporter = Exporter::new(&settings.paths, keyring.clone(), audit.clone());

        Ok(Self {
            settings,
            audit,
            keyring,
            apply,
            ingest,
            exporter,
            watcher: None,
        })
    }

    /// Build with the `wg` tool as the reconciliation backend
    pub fn with_wg_tool(settings: Settings) -> ControlResult<Self> {
        let tool = WgTool::new(settings.apply.wg_binary.clone(), settings.apply.tool_timeout());
        Self::new(settings, Arc::new(tool))
    }

    /// Active settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Shared audit sink
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Key material owner
    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    // ─── Control operations ──────────────────────────────────────────────

    /// Parse and validate a configuration without applying it
    pub fn check(&self, interface: &str, text: &str) -> ControlResult<ConfigSummary> {
        self.apply.validate(interface, text)
    }

    /// Apply `text` to `interface`
    pub fn apply(&self, interface: &str, text: &str) -> ControlResult<ApplyReport> {
        self.apply.apply(interface, text)
    }

    /// Apply the configuration staged in pending for `interface`
    pub fn promote_pending(&self, interface: &str) -> ControlResult<ApplyReport> {
        wgbridge_protocol::validate_interface_name(interface)?;
        let path = self
            .ingest
            .pending_path(interface)
            .join(crate::ingest::PENDING_CONFIG);
        let text = read_text(&path)?;
        self.apply.apply(interface, &text)
    }

    /// Export `interface` to the holder of `recipient` (base64 X25519 key)
    pub fn export_bundle(&self, interface: &str, recipient: &str) -> ControlResult<ExportReport> {
        let recipient = ExchangePublicKey::from_base64(recipient)
            .map_err(|e| ControlError::Validation(format!("recipient key: {}", e)))?;
        self.exporter.export_bundle(interface, &recipient)
    }

    /// Rotate keys and re-seal resident inbox bundles
    pub fn rotate_keys(&self) -> ControlResult<RotationReport> {
        self.keyring.rotate_keys()
    }

    /// Current exchange public key, base64
    pub fn exchange_key(&self) -> ControlResult<String> {
        Ok(self.keyring.exchange_key()?.to_base64())
    }

    /// Current signing key fingerprint
    pub fn signing_fingerprint(&self) -> ControlResult<String> {
        self.keyring.signing_fingerprint()
    }

    /// Verification status of every inbox bundle
    pub fn list_inbox_bundles(&self) -> ControlResult<Vec<InboxBundleStatus>> {
        self.ingest.list_inbox_bundles()
    }

    /// Ingest one bundle now
    pub fn handle_bundle(&self, path: &Path) -> IngestReport {
        self.ingest.handle_bundle(path)
    }

    // ─── Watcher lifecycle ───────────────────────────────────────────────

    /// Start the inbox watcher; returns a receiver for its reports.
    /// Must be called from within a Tokio runtime.
    pub fn start_watching(&mut self) -> ControlResult<broadcast::Receiver<IngestReport>> {
        if self.watcher.is_some() {
            return Err(ControlError::Validation("inbox watcher already running".into()));
        }
        let watcher = InboxWatcher::start(self.ingest.clone(), self.settings.exchange.workers)?;
        let reports = watcher.subscribe();
        self.watcher = Some(watcher);
        Ok(reports)
    }

    /// Whether the watcher is running
    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Stop the watcher, if running, and wait for in-flight ingests
    pub async fn shutdown(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown().await;
        }
    }
}

fn read_text(path: &Path) -> ControlResult<String> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            ControlError::Validation(format!("nothing pending at {}", path.display()))
        }
        std::io::ErrorKind::InvalidData => {
            ControlError::Validation(format!("{} is not valid UTF-8", path.display()))
        }
        _ => ControlError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::signature_path;
    use crate::testutil::{audit_actions, sample_config, FakeInterface};
    use std::fs;

    fn plane(root: &Path) -> (ControlPlane, Arc<FakeInterface>) {
        let fake = Arc::new(FakeInterface::new());
        let plane = ControlPlane::new(Settings::rooted_at(root), fake.clone()).unwrap();
        (plane, fake)
    }

    #[test]
    fn test_startup_generates_keys_once() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = plane(dir.path());
        let key = first.exchange_key().unwrap();
        drop(first);

        let (second, _) = plane(dir.path());
        assert_eq!(second.exchange_key().unwrap(), key);
        let generated = audit_actions(&dir.path().join("audit.jsonl"))
            .into_iter()
            .filter(|a| a == "keys_generated")
            .count();
        assert_eq!(generated, 1);
    }

    #[test]
    fn test_invalid_settings_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::rooted_at(dir.path());
        settings.exchange.workers = 0;
        assert!(ControlPlane::new(settings, Arc::new(FakeInterface::new())).is_err());
    }

    #[test]
    fn test_full_exchange_lifecycle() {
        // node A exports, node B ingests and promotes
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let (a, _) = plane(a_dir.path());
        let (b, b_iface) = plane(b_dir.path());

        // B trusts A's signing key
        fs::write(
            b_dir.path().join("trusted_signers"),
            format!("{}\n", a.keyring().signing_public().unwrap().to_base64()),
        )
        .unwrap();

        let text = sample_config(51820, &[2, 3]);
        a.apply("wg0", &text).unwrap();
        let exported = a.export_bundle("wg0", &b.exchange_key().unwrap()).unwrap();

        let inbox = &b.settings().paths.inbox_dir;
        fs::create_dir_all(inbox).unwrap();
        let delivered = inbox.join(exported.bundle.file_name().unwrap());
        fs::copy(&exported.bundle, &delivered).unwrap();
        fs::copy(&exported.signature, signature_path(&delivered)).unwrap();

        let listed = b.list_inbox_bundles().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].signature && listed[0].recipient && listed[0].checksum);

        assert!(b.handle_bundle(&delivered).is_ready());
        let report = b.promote_pending("wg0").unwrap();
        assert_eq!(report.checksum, exported.checksum);
        assert_eq!(b_iface.live("wg0").peers.len(), 2);
    }

    #[test]
    fn test_bad_inputs_are_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (plane, _) = plane(dir.path());

        assert_eq!(plane.export_bundle("wg0", "not a key").unwrap_err().kind(), "validation");
        assert_eq!(plane.promote_pending("wg0").unwrap_err().kind(), "validation");
        assert_eq!(plane.promote_pending("../wg0").unwrap_err().kind(), "validation");
        assert!(plane.check("wg0", &sample_config(51820, &[2])).is_ok());
        assert!(plane.check("wg0", "garbage").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watcher_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (mut plane, _) = plane(dir.path());

        let _reports = plane.start_watching().unwrap();
        assert!(plane.is_watching());
        assert!(plane.start_watching().is_err());

        plane.shutdown().await;
        assert!(!plane.is_watching());
        plane.shutdown().await;
    }
}
