//! Bundle export
//!
//! Packages a live configuration for another node: manifest and payload
//! are archived, sealed to the recipient's exchange key and signed with the
//! local signing key. Bundle and signature are staged under temporary
//! names and only appear in the outbox once both exist.

use crate::audit::{AuditLogger, EventAction, EventOutcome};
use crate::bundle::{self, SignatureFile, BUNDLE_EXT, SIG_EXT};
use crate::error::{ControlError, ControlResult};
use crate::fsutil;
use crate::keyring::Keyring;
use crate::settings::PathSettings;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use wgbridge_protocol::{sha256_hex, validate_interface_name, ExchangePublicKey, Manifest};

/// A bundle written to the outbox
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    /// Exported interface
    pub interface: String,
    /// Sealed bundle
    pub bundle: PathBuf,
    /// Detached signature next to it
    pub signature: PathBuf,
    /// SHA-256 of the exported configuration
    pub checksum: String,
    /// Recipient exchange key, base64
    pub recipient: String,
}

/// Builds signed, sealed bundles from live configurations
#[derive(Clone)]
pub struct Exporter {
    config_dir: PathBuf,
    outbox_dir: PathBuf,
    keyring: Keyring,
    audit: AuditLogger,
}

impl Exporter {
    /// Create an exporter over the configured directories
    pub fn new(paths: &PathSettings, keyring: Keyring, audit: AuditLogger) -> Self {
        Self {
            config_dir: paths.config_dir.clone(),
            outbox_dir: paths.outbox_dir.clone(),
            keyring,
            audit,
        }
    }

    /// Export the live configuration of `interface` for `recipient`
    pub fn export_bundle(
        &self,
        interface: &str,
        recipient: &ExchangePublicKey,
    ) -> ControlResult<ExportReport> {
        self.export_bundle_with_metadata(interface, recipient, &[])
    }

    /// Export with auxiliary files placed under `meta/` in the archive
    pub fn export_bundle_with_metadata(
        &self,
        interface: &str,
        recipient: &ExchangePublicKey,
        metadata: &[(String, Vec<u8>)],
    ) -> ControlResult<ExportReport> {
        let mut checksum = None;
        let result = self.build(interface, recipient, metadata, &mut checksum);

        match &result {
            Ok(report) => {
                let signer = self.keyring.signing_fingerprint().ok();
                tracing::info!("Exported {} to {}", interface, report.bundle.display());
                self.audit.log_exchange(
                    EventAction::BundleExported,
                    EventOutcome::Success,
                    Some(interface),
                    &file_name(&report.bundle),
                    Some(&report.checksum),
                    signer.as_deref(),
                    None,
                );
            }
            Err(e) => {
                tracing::warn!("Export of {} failed: {}", interface, e);
                self.audit.log_exchange(
                    EventAction::ExportFailed,
                    EventOutcome::Failure,
                    Some(interface),
                    interface,
                    checksum.as_deref(),
                    None,
                    Some(e.to_string()),
                );
            }
        }
        result
    }

    fn build(
        &self,
        interface: &str,
        recipient: &ExchangePublicKey,
        metadata: &[(String, Vec<u8>)],
        checksum: &mut Option<String>,
    ) -> ControlResult<ExportReport> {
        validate_interface_name(interface)?;
        for (name, _) in metadata {
            bundle::validate_meta_name(name)?;
        }

        let config = fs::read(self.config_dir.join(format!("{}.conf", interface)))?;
        if config.is_empty() {
            return Err(ControlError::Validation(format!(
                "live configuration of {} is empty",
                interface
            )));
        }
        let sum = sha256_hex(&config);
        *checksum = Some(sum.clone());

        let source = hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().into_owned());
        let manifest = Manifest::for_payload(interface, &config, source);
        let archive = bundle::pack(&manifest, &config, metadata)?;

        let backend = self.keyring.backend();
        let sealed = backend.seal(recipient, &archive)?;
        let signature = SignatureFile::sign(backend, &self.keyring.signing_secret()?, &sealed)?;
        let signature_json = signature.to_json()?;

        fsutil::ensure_private_dir(&self.outbox_dir)?;
        let stem = format!("{}-{}", interface, unix_nanos());
        let bundle_path = self.outbox_dir.join(format!("{}.{}", stem, BUNDLE_EXT));
        let sig_path = bundle::signature_path(&bundle_path);

        let staged_bundle = fsutil::stage_file(&self.outbox_dir, &stem, &sealed)?;
        let staged_sig = match fsutil::stage_file(&self.outbox_dir, &format!("{}.{}", stem, SIG_EXT), &signature_json) {
            Ok(path) => path,
            Err(e) => {
                let _ = fsutil::remove_if_exists(&staged_bundle);
                return Err(e.into());
            }
        };

        let published = fs::rename(&staged_bundle, &bundle_path)
            .and_then(|()| fs::rename(&staged_sig, &sig_path));
        if let Err(e) = published {
            for leftover in [&staged_bundle, &staged_sig, &bundle_path, &sig_path] {
                let _ = fsutil::remove_if_exists(leftover);
            }
            return Err(e.into());
        }
        fsutil::sync_dir(&self.outbox_dir);

        Ok(ExportReport {
            interface: interface.to_string(),
            bundle: bundle_path,
            signature: sig_path,
            checksum: sum,
            recipient: recipient.to_base64(),
        })
    }
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{IngestPipeline, PENDING_CONFIG};
    use crate::settings::ExchangeSettings;
    use crate::testutil::{read_audit, sample_config, test_audit};
    use std::sync::Arc;
    use wgbridge_protocol::{ExchangeCrypto, SoftwareBackend};

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        paths: PathSettings,
        keyring: Keyring,
        exporter: Exporter,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let paths = PathSettings::under(&root);
            let audit = test_audit(&root.join("audit.jsonl"));
            let keyring = Keyring::new(&paths, Arc::new(SoftwareBackend::new()), audit.clone());
            keyring.ensure_keys().unwrap();
            let exporter = Exporter::new(&paths, keyring.clone(), audit);
            Self {
                _dir: dir,
                root,
                paths,
                keyring,
                exporter,
            }
        }

        fn write_live(&self, interface: &str, text: &str) {
            fs::create_dir_all(&self.paths.config_dir).unwrap();
            fs::write(self.paths.config_dir.join(format!("{}.conf", interface)), text).unwrap();
        }

        fn outbox_files(&self) -> Vec<String> {
            match fs::read_dir(&self.paths.outbox_dir) {
                Ok(entries) => entries
                    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .collect(),
                Err(_) => Vec::new(),
            }
        }
    }

    #[test]
    fn test_export_then_self_ingest_round_trip() {
        let fx = Fixture::new();
        let text = sample_config(51820, &[2, 3]);
        fx.write_live("wg0", &text);

        let own_key = fx.keyring.exchange_key().unwrap();
        let report = fx.exporter.export_bundle("wg0", &own_key).unwrap();
        assert_eq!(report.checksum, sha256_hex(text.as_bytes()));
        assert!(report.bundle.exists() && report.signature.exists());

        // carry the pair into the inbox as a transfer would
        let inbox = &fx.paths.inbox_dir;
        fs::create_dir_all(inbox).unwrap();
        let delivered = inbox.join(report.bundle.file_name().unwrap());
        fs::copy(&report.signature, bundle::signature_path(&delivered)).unwrap();
        fs::copy(&report.bundle, &delivered).unwrap();

        let pipeline = IngestPipeline::new(
            &fx.paths,
            &ExchangeSettings::default(),
            fx.keyring.clone(),
            test_audit(&fx.root.join("audit.jsonl")),
        );
        let ingested = pipeline.handle_bundle(&delivered);
        assert!(ingested.is_ready(), "{:?}", ingested.outcome);
        assert_eq!(ingested.checksum.as_deref(), Some(report.checksum.as_str()));

        let pending = fs::read(pipeline.pending_path("wg0").join(PENDING_CONFIG)).unwrap();
        assert_eq!(pending, text.as_bytes());
        assert_eq!(sha256_hex(&pending), report.checksum);
    }

    #[test]
    fn test_bundle_is_sealed_and_signed() {
        let fx = Fixture::new();
        fx.write_live("wg0", &sample_config(51820, &[2]));
        let backend = SoftwareBackend::new();
        let (recipient, recipient_secret) = backend.exchange_keygen().unwrap();

        let report = fx.exporter.export_bundle("wg0", &recipient).unwrap();
        let sealed = fs::read(&report.bundle).unwrap();

        // only the recipient can open it
        assert!(backend.open(&fx.keyring.exchange_secret().unwrap(), &sealed).is_err());
        let archive = backend.open(&recipient_secret, &sealed).unwrap();
        let contents = bundle::unpack(&archive, true).unwrap();
        assert_eq!(contents.manifest.interface, "wg0");
        assert_eq!(contents.manifest.version, 1);
        assert!(contents.manifest.timestamp.is_some());

        let sig = SignatureFile::read(&report.signature).unwrap();
        let signer = sig
            .verify(&backend, &[fx.keyring.signing_public().unwrap()], &sealed)
            .unwrap();
        assert_eq!(signer, fx.keyring.signing_public().unwrap());

        let records = read_audit(&fx.root.join("audit.jsonl"));
        let exported = records.iter().find(|r| r["action"] == "bundle_exported").unwrap();
        assert_eq!(exported["checksum"], report.checksum.as_str());
    }

    #[test]
    fn test_metadata_travels_with_bundle() {
        let fx = Fixture::new();
        fx.write_live("wg0", &sample_config(51820, &[2]));
        let own_key = fx.keyring.exchange_key().unwrap();
        let meta = vec![("routes.txt".to_string(), b"10.0.0.0/8".to_vec())];

        let report = fx
            .exporter
            .export_bundle_with_metadata("wg0", &own_key, &meta)
            .unwrap();
        let archive = fx
            .keyring
            .backend()
            .open(&fx.keyring.exchange_secret().unwrap(), &fs::read(&report.bundle).unwrap())
            .unwrap();
        assert_eq!(bundle::unpack(&archive, true).unwrap().metadata, meta);

        let bad = vec![("../escape".to_string(), b"x".to_vec())];
        assert!(fx
            .exporter
            .export_bundle_with_metadata("wg0", &own_key, &bad)
            .is_err());
    }

    #[test]
    fn test_missing_config_leaves_nothing_behind() {
        let fx = Fixture::new();
        let own_key = fx.keyring.exchange_key().unwrap();

        let err = fx.exporter.export_bundle("wg9", &own_key).unwrap_err();
        assert_eq!(err.kind(), "io");
        assert!(fx.outbox_files().is_empty());
        assert!(fx.exporter.export_bundle("../wg0", &own_key).is_err());

        let records = read_audit(&fx.root.join("audit.jsonl"));
        assert!(records.iter().any(|r| r["action"] == "export_failed"));
    }

    #[test]
    fn test_signing_failure_is_audited_with_checksum() {
        let fx = Fixture::new();
        let text = sample_config(51820, &[2]);
        fx.write_live("wg0", &text);
        let own_key = fx.keyring.exchange_key().unwrap();
        fs::remove_file(fx.paths.key_dir.join(crate::keyring::SIGNING_KEY_FILE)).unwrap();

        assert!(fx.exporter.export_bundle("wg0", &own_key).is_err());
        assert!(fx.outbox_files().is_empty());

        let records = read_audit(&fx.root.join("audit.jsonl"));
        let failed = records.iter().find(|r| r["action"] == "export_failed").unwrap();
        assert_eq!(failed["checksum"], sha256_hex(text.as_bytes()).as_str());
    }
}
