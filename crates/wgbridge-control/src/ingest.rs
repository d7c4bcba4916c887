//! Inbox bundle ingestion
//!
//! Each bundle runs through a fixed sequence of gates. The first failing
//! gate rejects the bundle: the rejection is audited and the bundle and
//! its signature stay in the inbox for inspection. Only a bundle that
//! clears every gate is staged into `<pending>/<iface>/` and removed.

use crate::audit::{AuditLogger, EventAction, EventOutcome};
use crate::bundle::{self, signature_path, BundleContents, SignatureFile};
use crate::error::{ControlError, ControlResult};
use crate::fsutil;
use crate::keyring::Keyring;
use crate::settings::{ExchangeSettings, PathSettings};
use dashmap::DashMap;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use wgbridge_protocol::{checksum_matches, fingerprint};

/// Pending file holding the configuration payload
pub const PENDING_CONFIG: &str = "config.conf";
/// Pending file holding the bundle manifest
pub const PENDING_MANIFEST: &str = "manifest.json";
/// Pending subdirectory holding auxiliary files
pub const PENDING_META_DIR: &str = "meta";

/// Gate at which a bundle was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    /// Detached signature missing or not from a trusted signer
    Signature,
    /// Not sealed to this node's exchange key
    Decrypt,
    /// Archive malformed, manifest invalid or payload missing
    Unpack,
    /// Payload does not match the manifest checksum
    Checksum,
    /// Writing into the pending area failed
    Stage,
}

impl IngestStage {
    /// Lowercase stage name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signature => "signature",
            Self::Decrypt => "decrypt",
            Self::Unpack => "unpack",
            Self::Checksum => "checksum",
            Self::Stage => "stage",
        }
    }
}

/// How a bundle's ingestion ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Staged into pending; bundle and signature removed
    Ready,
    /// Left in the inbox
    Rejected {
        /// Failing gate
        stage: IngestStage,
        /// Error detail
        reason: String,
    },
}

/// Result of one bundle ingestion
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    /// Bundle path
    pub bundle: PathBuf,
    /// Target interface, once the manifest was read
    pub interface: Option<String>,
    /// Manifest checksum, once the manifest was read
    pub checksum: Option<String>,
    /// Fingerprint of the verified signer
    pub signer: Option<String>,
    /// Outcome
    #[serde(flatten)]
    pub outcome: IngestOutcome,
}

impl IngestReport {
    /// Whether the bundle was staged into pending
    pub fn is_ready(&self) -> bool {
        self.outcome == IngestOutcome::Ready
    }
}

/// Read-only verification summary of one inbox bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboxBundleStatus {
    /// Bundle file name
    pub file: String,
    /// Signature present and from a trusted signer
    pub signature: bool,
    /// Opens with this node's exchange key
    pub recipient: bool,
    /// Payload matches the manifest checksum
    pub checksum: bool,
    /// Target interface, when the bundle could be opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

/// Verifies inbox bundles and stages them into pending
#[derive(Clone)]
pub struct IngestPipeline {
    inbox_dir: PathBuf,
    pending_dir: PathBuf,
    strict_manifest: bool,
    keyring: Keyring,
    audit: AuditLogger,
    staging: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl IngestPipeline {
    /// Create a pipeline over the configured inbox and pending directories
    pub fn new(
        paths: &PathSettings,
        exchange: &ExchangeSettings,
        keyring: Keyring,
        audit: AuditLogger,
    ) -> Self {
        Self {
            inbox_dir: paths.inbox_dir.clone(),
            pending_dir: paths.pending_dir.clone(),
            strict_manifest: exchange.strict_manifest,
            keyring,
            audit,
            staging: Arc::new(DashMap::new()),
        }
    }

    /// Inbox directory
    pub fn inbox_dir(&self) -> &Path {
        &self.inbox_dir
    }

    pub(crate) fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Pending directory for `interface`
    pub fn pending_path(&self, interface: &str) -> PathBuf {
        self.pending_dir.join(interface)
    }

    /// Create the inbox if it does not exist
    pub fn ensure_inbox(&self) -> ControlResult<()> {
        fsutil::ensure_private_dir(&self.inbox_dir)?;
        Ok(())
    }

    /// Run one bundle through every gate
    pub fn handle_bundle(&self, path: &Path) -> IngestReport {
        let mut report = IngestReport {
            bundle: path.to_path_buf(),
            interface: None,
            checksum: None,
            signer: None,
            outcome: IngestOutcome::Ready,
        };
        let name = display_name(path);

        match self.process(path, &mut report) {
            Ok(staged) => {
                for leftover in [path.to_path_buf(), signature_path(path)] {
                    if let Err(e) = fsutil::remove_if_exists(&leftover) {
                        tracing::warn!("Bundle {} staged but {} not removed: {}", name, leftover.display(), e);
                    }
                }
                tracing::info!("Bundle {} ready in {}", name, staged.display());
                self.audit.log_exchange(
                    EventAction::BundleReady,
                    EventOutcome::Success,
                    report.interface.as_deref(),
                    &name,
                    report.checksum.as_deref(),
                    report.signer.as_deref(),
                    None,
                );
            }
            Err((stage, err)) => {
                tracing::warn!("Bundle {} rejected at {}: {}", name, stage.as_str(), err);
                let outcome = match stage {
                    IngestStage::Signature => EventOutcome::Denied,
                    _ => EventOutcome::Failure,
                };
                self.audit.log_exchange(
                    EventAction::BundleRejected,
                    outcome,
                    report.interface.as_deref(),
                    &name,
                    report.checksum.as_deref(),
                    report.signer.as_deref(),
                    Some(format!("{}: {}", stage.as_str(), err)),
                );
                report.outcome = IngestOutcome::Rejected {
                    stage,
                    reason: err.to_string(),
                };
            }
        }
        report
    }

    fn process(
        &self,
        path: &Path,
        report: &mut IngestReport,
    ) -> Result<PathBuf, (IngestStage, ControlError)> {
        use IngestStage::*;

        // 1-2. signature
        let sig_path = signature_path(path);
        if !sig_path.exists() {
            return Err((
                Signature,
                ControlError::Verification("missing signature".into()),
            ));
        }
        let sealed = fs::read(path).map_err(|e| (Signature, ControlError::from(e)))?;
        let signer = self
            .keyring
            .trusted_signers()
            .and_then(|trusted| {
                SignatureFile::read(&sig_path)?.verify(self.keyring.backend(), &trusted, &sealed)
            })
            .map_err(|e| (Signature, e))?;
        report.signer = Some(fingerprint(&signer));

        // 3. decrypt, in memory only
        let archive = self
            .keyring
            .exchange_secret()
            .and_then(|secret| Ok(self.keyring.backend().open(&secret, &sealed)?))
            .map_err(|e| (Decrypt, e))?;

        // 4. unpack
        let contents = bundle::unpack(&archive, self.strict_manifest).map_err(|e| (Unpack, e))?;
        report.interface = Some(contents.manifest.interface.clone());
        report.checksum = Some(contents.manifest.checksum.to_ascii_lowercase());

        // 5. checksum
        contents
            .manifest
            .verify_payload(&contents.config)
            .map_err(|e| (Checksum, ControlError::from(e)))?;

        // 6. stage
        self.stage_pending(&contents).map_err(|e| (Stage, e))
    }

    /// Write payload, manifest and metadata under `<pending>/<iface>/`.
    ///
    /// The tree is built in a staging directory beside it and swapped in
    /// whole, so pending holds exactly one bundle's files. Concurrent
    /// bundles for one interface are staged one at a time; the last one
    /// staged wins.
    fn stage_pending(&self, contents: &BundleContents) -> ControlResult<PathBuf> {
        let interface = &contents.manifest.interface;
        for (name, _) in &contents.metadata {
            bundle::validate_meta_name(name)?;
        }

        let slot = self
            .staging
            .entry(interface.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = slot.lock().unwrap_or_else(|e| e.into_inner());

        fsutil::ensure_private_dir(&self.pending_dir)?;
        let staged = fsutil::stage_dir(&self.pending_dir, interface)?;
        let dest = self.pending_path(interface);

        let result = write_pending_tree(&staged, contents)
            .and_then(|()| Ok(fsutil::replace_dir(&staged, &dest)?));
        if result.is_err() {
            if let Err(e) = fs::remove_dir_all(&staged) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Staging tree {} not removed: {}", staged.display(), e);
                }
            }
        }
        result.map(|()| dest)
    }

    /// Verification status of every bundle in the inbox. Never modifies
    /// anything.
    pub fn list_inbox_bundles(&self) -> ControlResult<Vec<InboxBundleStatus>> {
        let bundles = bundle::list_bundles(&self.inbox_dir)?;
        let trusted = self.keyring.trusted_signers()?;
        let secret = self.keyring.exchange_secret().ok();
        let backend = self.keyring.backend();

        let mut statuses = Vec::with_capacity(bundles.len());
        for path in bundles {
            let mut status = InboxBundleStatus {
                file: display_name(&path),
                signature: false,
                recipient: false,
                checksum: false,
                interface: None,
            };
            let sealed = match fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Cannot read {}: {}", path.display(), e);
                    statuses.push(status);
                    continue;
                }
            };

            status.signature = SignatureFile::read(&signature_path(&path))
                .and_then(|sig| sig.verify(backend, &trusted, &sealed))
                .is_ok();

            if let Some(archive) = secret.as_ref().and_then(|s| backend.open(s, &sealed).ok()) {
                status.recipient = true;
                if let Ok(contents) = bundle::unpack(&archive, self.strict_manifest) {
                    status.checksum =
                        checksum_matches(&contents.manifest.checksum, &contents.config);
                    status.interface = Some(contents.manifest.interface);
                }
            }
            statuses.push(status);
        }
        Ok(statuses)
    }
}

fn write_pending_tree(dir: &Path, contents: &BundleContents) -> ControlResult<()> {
    fsutil::write_atomic(&dir.join(PENDING_CONFIG), &contents.config)?;
    fsutil::write_atomic(&dir.join(PENDING_MANIFEST), &contents.manifest.to_json()?)?;

    let meta_dir = dir.join(PENDING_META_DIR);
    for (name, data) in &contents.metadata {
        let target = meta_dir.join(name);
        fsutil::ensure_private_dir(fsutil::parent_dir(&target))?;
        fsutil::write_atomic(&target, data)?;
    }
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{read_audit, test_audit, write_sealed_bundle};
    use wgbridge_protocol::{sha256_hex, ExchangeCrypto, Manifest, SoftwareBackend};

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        keyring: Keyring,
        pipeline: IngestPipeline,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let paths = PathSettings::under(&root);
            let audit = test_audit(&root.join("audit.jsonl"));
            let keyring = Keyring::new(&paths, Arc::new(SoftwareBackend::new()), audit.clone());
            keyring.ensure_keys().unwrap();
            let pipeline =
                IngestPipeline::new(&paths, &ExchangeSettings::default(), keyring.clone(), audit);
            pipeline.ensure_inbox().unwrap();
            Self {
                _dir: dir,
                root,
                keyring,
                pipeline,
            }
        }

        /// Drop a bundle for this node, signed by this node, into the inbox
        fn deliver(&self, name: &str, manifest: &Manifest, config: &[u8]) -> PathBuf {
            let archive = bundle::pack(manifest, config, &[]).unwrap();
            self.deliver_archive(name, &archive)
        }

        fn deliver_archive(&self, name: &str, archive: &[u8]) -> PathBuf {
            let path = self.root.join("inbox").join(name);
            write_sealed_bundle(
                &path,
                self.keyring.backend(),
                &self.keyring.exchange_key().unwrap(),
                &self.keyring.signing_secret().unwrap(),
                archive,
            );
            path
        }

        fn audit(&self) -> Vec<serde_json::Value> {
            read_audit(&self.root.join("audit.jsonl"))
        }
    }

    const CONFIG: &[u8] = b"[Interface]\nPrivateKey = x\n\n[Peer]\nPublicKey = y\nAllowedIPs = 10.0.0.2/32\n";

    fn rejected_at(report: &IngestReport) -> Option<IngestStage> {
        match &report.outcome {
            IngestOutcome::Rejected { stage, .. } => Some(*stage),
            IngestOutcome::Ready => None,
        }
    }

    #[test]
    fn test_valid_bundle_is_staged_and_removed() {
        let fx = Fixture::new();
        let manifest = Manifest::for_payload("wg0", CONFIG, Some("node-b".into()));
        let meta = vec![("peers/notes.txt".to_string(), b"hello".to_vec())];
        let archive = bundle::pack(&manifest, CONFIG, &meta).unwrap();
        let path = fx.deliver_archive("wg0-1.wgx", &archive);

        let report = fx.pipeline.handle_bundle(&path);
        assert!(report.is_ready(), "{:?}", report.outcome);
        assert_eq!(report.interface.as_deref(), Some("wg0"));
        assert_eq!(report.signer, Some(fx.keyring.signing_fingerprint().unwrap()));

        let pending = fx.pipeline.pending_path("wg0");
        assert_eq!(fs::read(pending.join(PENDING_CONFIG)).unwrap(), CONFIG);
        assert_eq!(fs::read(pending.join("meta/peers/notes.txt")).unwrap(), b"hello");
        let staged: Manifest =
            serde_json::from_slice(&fs::read(pending.join(PENDING_MANIFEST)).unwrap()).unwrap();
        assert_eq!(staged.checksum, sha256_hex(CONFIG));

        assert!(!path.exists());
        assert!(!signature_path(&path).exists());

        let ready = fx.audit().into_iter().find(|r| r["action"] == "bundle_ready").unwrap();
        assert_eq!(ready["interface"], "wg0");
        assert_eq!(ready["bundle"], "wg0-1.wgx");
    }

    #[test]
    fn test_missing_signature_is_left_in_place() {
        let fx = Fixture::new();
        let path = fx.deliver("wg0-1.wgx", &Manifest::for_payload("wg0", CONFIG, None), CONFIG);
        fs::remove_file(signature_path(&path)).unwrap();

        let report = fx.pipeline.handle_bundle(&path);
        assert_eq!(rejected_at(&report), Some(IngestStage::Signature));
        assert!(path.exists());
        assert!(!fx.pipeline.pending_path("wg0").exists());
    }

    #[test]
    fn test_untrusted_signer_is_denied() {
        let fx = Fixture::new();
        let backend = SoftwareBackend::new();
        let (_, stranger) = backend.signing_keygen().unwrap();
        let archive = bundle::pack(&Manifest::for_payload("wg0", CONFIG, None), CONFIG, &[]).unwrap();
        let path = fx.root.join("inbox").join("wg0-1.wgx");
        write_sealed_bundle(&path, &backend, &fx.keyring.exchange_key().unwrap(), &stranger, &archive);

        let report = fx.pipeline.handle_bundle(&path);
        assert_eq!(rejected_at(&report), Some(IngestStage::Signature));
        assert!(path.exists() && signature_path(&path).exists());

        let rejected = fx.audit().into_iter().find(|r| r["action"] == "bundle_rejected").unwrap();
        assert_eq!(rejected["outcome"], "denied");
    }

    #[test]
    fn test_bundle_for_another_node_fails_decrypt() {
        let fx = Fixture::new();
        let backend = SoftwareBackend::new();
        let (other_node, _) = backend.exchange_keygen().unwrap();
        let archive = bundle::pack(&Manifest::for_payload("wg0", CONFIG, None), CONFIG, &[]).unwrap();
        let path = fx.root.join("inbox").join("wg0-1.wgx");
        write_sealed_bundle(
            &path,
            &backend,
            &other_node,
            &fx.keyring.signing_secret().unwrap(),
            &archive,
        );

        let report = fx.pipeline.handle_bundle(&path);
        assert_eq!(rejected_at(&report), Some(IngestStage::Decrypt));
        assert!(path.exists());
    }

    #[test]
    fn test_checksum_mismatch_stages_nothing() {
        let fx = Fixture::new();
        let mut manifest = Manifest::for_payload("wg0", CONFIG, None);
        manifest.checksum = sha256_hex(b"something else");
        let path = fx.deliver("wg0-1.wgx", &manifest, CONFIG);

        let report = fx.pipeline.handle_bundle(&path);
        assert_eq!(rejected_at(&report), Some(IngestStage::Checksum));
        assert!(!fx.root.join("pending").exists());
        assert!(path.exists());

        let rejected = fx.audit().into_iter().find(|r| r["action"] == "bundle_rejected").unwrap();
        assert_eq!(rejected["outcome"], "failure");
        assert!(rejected["reason"].as_str().unwrap().contains("checksum"));
        assert_eq!(rejected["checksum"], manifest.checksum.as_str());
    }

    #[test]
    fn test_uppercase_checksum_is_accepted() {
        let fx = Fixture::new();
        let mut manifest = Manifest::for_payload("wg0", CONFIG, None);
        manifest.checksum = manifest.checksum.to_ascii_uppercase();
        let path = fx.deliver("wg0-1.wgx", &manifest, CONFIG);
        assert!(fx.pipeline.handle_bundle(&path).is_ready());
    }

    #[test]
    fn test_empty_payload_fails_unpack() {
        let fx = Fixture::new();
        let path = fx.deliver("wg0-1.wgx", &Manifest::for_payload("wg0", CONFIG, None), b"");
        assert_eq!(
            rejected_at(&fx.pipeline.handle_bundle(&path)),
            Some(IngestStage::Unpack)
        );
    }

    #[test]
    fn test_same_interface_bundles_never_mix() {
        let fx = Fixture::new();
        let payloads: Vec<Vec<u8>> = (0..4)
            .map(|i| format!("{}# revision {}\n", String::from_utf8_lossy(CONFIG), i).into_bytes())
            .collect();
        let paths: Vec<_> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| fx.deliver(&format!("wg0-{}.wgx", i), &Manifest::for_payload("wg0", p, None), p))
            .collect();

        let handles: Vec<_> = paths
            .into_iter()
            .map(|path| {
                let pipeline = fx.pipeline.clone();
                std::thread::spawn(move || pipeline.handle_bundle(&path))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_ready());
        }

        // the last writer wins, and its manifest matches its payload
        let pending = fx.pipeline.pending_path("wg0");
        let config = fs::read(pending.join(PENDING_CONFIG)).unwrap();
        assert!(payloads.contains(&config));
        let manifest: Manifest =
            serde_json::from_slice(&fs::read(pending.join(PENDING_MANIFEST)).unwrap()).unwrap();
        assert_eq!(manifest.checksum, sha256_hex(&config));
    }

    #[test]
    fn test_restaging_drops_previous_bundle_metadata() {
        let fx = Fixture::new();
        let first = b"[Interface]\nPrivateKey = x\n# first\n".to_vec();
        let meta = vec![("routes.txt".to_string(), b"from first".to_vec())];
        let archive =
            bundle::pack(&Manifest::for_payload("wg0", &first, None), &first, &meta).unwrap();
        let path = fx.deliver_archive("wg0-1.wgx", &archive);
        assert!(fx.pipeline.handle_bundle(&path).is_ready());

        let pending = fx.pipeline.pending_path("wg0");
        assert!(pending.join("meta/routes.txt").exists());

        let path = fx.deliver("wg0-2.wgx", &Manifest::for_payload("wg0", CONFIG, None), CONFIG);
        assert!(fx.pipeline.handle_bundle(&path).is_ready());

        assert_eq!(fs::read(pending.join(PENDING_CONFIG)).unwrap(), CONFIG);
        assert!(!pending.join("meta/routes.txt").exists());
        assert!(!pending.join(PENDING_META_DIR).exists());

        // no staging or retired trees left beside it
        let names: Vec<_> = fs::read_dir(fx.root.join("pending"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["wg0".to_string()]);
    }

    #[test]
    fn test_list_inbox_bundles_is_read_only() {
        let fx = Fixture::new();
        let good = fx.deliver("a.wgx", &Manifest::for_payload("wg0", CONFIG, None), CONFIG);
        let mut bad_manifest = Manifest::for_payload("wg1", CONFIG, None);
        bad_manifest.checksum = sha256_hex(b"other");
        fx.deliver("b.wgx", &bad_manifest, CONFIG);
        fs::write(fx.root.join("inbox").join("c.wgx"), b"garbage").unwrap();

        let inbox_before = fs::read_dir(fx.root.join("inbox")).unwrap().count();
        let statuses = fx.pipeline.list_inbox_bundles().unwrap();
        assert_eq!(
            statuses,
            vec![
                InboxBundleStatus {
                    file: "a.wgx".into(),
                    signature: true,
                    recipient: true,
                    checksum: true,
                    interface: Some("wg0".into()),
                },
                InboxBundleStatus {
                    file: "b.wgx".into(),
                    signature: true,
                    recipient: true,
                    checksum: false,
                    interface: Some("wg1".into()),
                },
                InboxBundleStatus {
                    file: "c.wgx".into(),
                    signature: false,
                    recipient: false,
                    checksum: false,
                    interface: None,
                },
            ]
        );

        assert_eq!(fs::read_dir(fx.root.join("inbox")).unwrap().count(), inbox_before);
        assert!(good.exists());
        assert!(!fx.root.join("pending").exists());
        assert!(fx.audit().iter().all(|r| r["category"] != "exchange"));
    }
}
