//! Node key material
//!
//! Four base64 files live in the key directory (0700), each 0600:
//!
//! | File | Contents |
//! |---|---|
//! | `exchange.key` | X25519 secret, opens bundles sent to this node |
//! | `exchange.pub` | X25519 public, handed to peers for export |
//! | `signing.key` | Ed25519 secret, signs exported bundles |
//! | `signing.pub` | Ed25519 public, always a trusted signer |
//!
//! Rotation renames the current generation to `<file>.<token>` and never
//! deletes it. Bundles already waiting in the inbox are re-sealed to the
//! new key so they stay ingestible.

use crate::audit::AuditLogger;
use crate::bundle::{self, signature_path, SignatureFile};
use crate::error::{ControlError, ControlResult};
use crate::fsutil;
use crate::settings::PathSettings;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use wgbridge_protocol::{
    fingerprint, ExchangeCrypto, ExchangePublicKey, ExchangeSecretKey, SigningPublicKey,
    SigningSecretKey,
};

/// Exchange secret key file
pub const EXCHANGE_KEY_FILE: &str = "exchange.key";
/// Exchange public key file
pub const EXCHANGE_PUB_FILE: &str = "exchange.pub";
/// Signing secret key file
pub const SIGNING_KEY_FILE: &str = "signing.key";
/// Signing public key file
pub const SIGNING_PUB_FILE: &str = "signing.pub";

const ROTATION_TOKEN_FORMAT: &str = "%Y%m%d%H%M%S";

/// Outcome of a key rotation
#[derive(Debug, Clone, Serialize)]
pub struct RotationReport {
    /// Suffix given to the retired key files
    pub token: String,
    /// New exchange public key, base64
    pub exchange_key: String,
    /// Fingerprint of the new signing key
    pub signing_fingerprint: String,
    /// Inbox bundles re-sealed to the new key
    pub reencrypted: usize,
    /// Inbox bundles left untouched
    pub skipped: usize,
}

/// Owner of the node's exchange and signing keys
#[derive(Clone)]
pub struct Keyring {
    key_dir: PathBuf,
    trusted_signers: PathBuf,
    inbox_dir: PathBuf,
    backend: Arc<dyn ExchangeCrypto>,
    audit: AuditLogger,
    rotation: Arc<Mutex<()>>,
}

impl Keyring {
    /// Create a keyring over the configured paths
    pub fn new(paths: &PathSettings, backend: Arc<dyn ExchangeCrypto>, audit: AuditLogger) -> Self {
        Self {
            key_dir: paths.key_dir.clone(),
            trusted_signers: paths.trusted_signers.clone(),
            inbox_dir: paths.inbox_dir.clone(),
            backend,
            audit,
            rotation: Arc::new(Mutex::new(())),
        }
    }

    /// Crypto backend shared with the exchange pipelines
    pub fn backend(&self) -> &dyn ExchangeCrypto {
        self.backend.as_ref()
    }

    fn path(&self, file: &str) -> PathBuf {
        self.key_dir.join(file)
    }

    /// Generate whatever key material is missing. Returns the names of the
    /// files written; empty when everything already existed.
    pub fn ensure_keys(&self) -> ControlResult<Vec<&'static str>> {
        fsutil::ensure_private_dir(&self.key_dir)?;
        let mut written = Vec::new();

        if !self.path(EXCHANGE_KEY_FILE).exists() {
            let (public, secret) = self.backend.exchange_keygen()?;
            write_key(&self.path(EXCHANGE_KEY_FILE), &secret.to_base64())?;
            write_key(&self.path(EXCHANGE_PUB_FILE), &public.to_base64())?;
            written.extend([EXCHANGE_KEY_FILE, EXCHANGE_PUB_FILE]);
        } else if !self.path(EXCHANGE_PUB_FILE).exists() {
            let public = self.backend.exchange_public(&self.exchange_secret()?);
            write_key(&self.path(EXCHANGE_PUB_FILE), &public.to_base64())?;
            written.push(EXCHANGE_PUB_FILE);
        }

        if !self.path(SIGNING_KEY_FILE).exists() {
            let (public, secret) = self.backend.signing_keygen()?;
            write_key(&self.path(SIGNING_KEY_FILE), &secret.to_base64())?;
            write_key(&self.path(SIGNING_PUB_FILE), &public.to_base64())?;
            written.extend([SIGNING_KEY_FILE, SIGNING_PUB_FILE]);
        } else if !self.path(SIGNING_PUB_FILE).exists() {
            let public = self.backend.signing_public(&self.signing_secret()?);
            write_key(&self.path(SIGNING_PUB_FILE), &public.to_base64())?;
            written.push(SIGNING_PUB_FILE);
        }

        if !written.is_empty() {
            let signer = self.signing_fingerprint()?;
            tracing::info!("Generated key material in {}: {}", self.key_dir.display(), written.join(", "));
            self.audit.log_keys_generated(&written, &signer);
        }
        Ok(written)
    }

    /// Retire the current keys, generate new ones, and re-seal every
    /// verifiable inbox bundle to the new exchange key.
    ///
    /// Bundles that fail verification or decryption are skipped, not fatal.
    pub fn rotate_keys(&self) -> ControlResult<RotationReport> {
        let _guard = self.rotation.lock().unwrap_or_else(|e| e.into_inner());
        fsutil::ensure_private_dir(&self.key_dir)?;

        // Everything needed to read old bundles, captured before the rename
        let old_secret = match self.exchange_secret() {
            Ok(secret) => Some(secret),
            Err(ControlError::Io(e)) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        let trusted = self.trusted_signers()?;

        let token = chrono::Utc::now().format(ROTATION_TOKEN_FORMAT).to_string();
        for file in [EXCHANGE_KEY_FILE, EXCHANGE_PUB_FILE, SIGNING_KEY_FILE, SIGNING_PUB_FILE] {
            let current = self.path(file);
            if current.exists() {
                let backup = backup_path(&current, &token);
                fs::rename(&current, &backup)?;
                tracing::debug!("Retired {} as {}", file, backup.display());
            }
        }
        fsutil::sync_dir(&self.key_dir);

        let (exchange_pub, exchange_secret) = self.backend.exchange_keygen()?;
        write_key(&self.path(EXCHANGE_KEY_FILE), &exchange_secret.to_base64())?;
        write_key(&self.path(EXCHANGE_PUB_FILE), &exchange_pub.to_base64())?;

        let (signing_pub, signing_secret) = self.backend.signing_keygen()?;
        write_key(&self.path(SIGNING_KEY_FILE), &signing_secret.to_base64())?;
        write_key(&self.path(SIGNING_PUB_FILE), &signing_pub.to_base64())?;

        let (reencrypted, skipped) = match &old_secret {
            Some(old) => self.reencrypt_inbox(old, &trusted, &exchange_pub, &signing_secret),
            None => (0, bundle::list_bundles(&self.inbox_dir).map_or(0, |b| b.len())),
        };

        let signer = fingerprint(&signing_pub);
        tracing::info!(
            "Keys rotated (token {}): {} inbox bundles re-encrypted, {} skipped",
            token,
            reencrypted,
            skipped
        );
        self.audit.log_keys_rotated(&token, &signer, reencrypted, skipped);

        Ok(RotationReport {
            token,
            exchange_key: exchange_pub.to_base64(),
            signing_fingerprint: signer,
            reencrypted,
            skipped,
        })
    }

    fn reencrypt_inbox(
        &self,
        old_secret: &ExchangeSecretKey,
        trusted: &[SigningPublicKey],
        new_public: &ExchangePublicKey,
        new_signer: &SigningSecretKey,
    ) -> (usize, usize) {
        let bundles = match bundle::list_bundles(&self.inbox_dir) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Cannot list inbox {}: {}", self.inbox_dir.display(), e);
                return (0, 0);
            }
        };

        let mut reencrypted = 0;
        let mut skipped = 0;
        for path in bundles {
            match self.reseal(&path, old_secret, trusted, new_public, new_signer) {
                Ok(()) => reencrypted += 1,
                Err(e) => {
                    tracing::warn!("Skipping {} during rotation: {}", path.display(), e);
                    skipped += 1;
                }
            }
        }
        (reencrypted, skipped)
    }

    fn reseal(
        &self,
        path: &Path,
        old_secret: &ExchangeSecretKey,
        trusted: &[SigningPublicKey],
        new_public: &ExchangePublicKey,
        new_signer: &SigningSecretKey,
    ) -> ControlResult<()> {
        let sealed = fs::read(path)?;
        let sig_path = signature_path(path);
        SignatureFile::read(&sig_path)?.verify(self.backend(), trusted, &sealed)?;

        let archive = self.backend.open(old_secret, &sealed)?;
        let resealed = self.backend.seal(new_public, &archive)?;
        let signature = SignatureFile::sign(self.backend(), new_signer, &resealed)?;

        // bundle first: a watcher that sees it before the new signature
        // rejects it and picks it up again when the signature lands
        fsutil::write_atomic(path, &resealed)?;
        fsutil::write_atomic(&sig_path, &signature.to_json()?)?;
        Ok(())
    }

    /// Current exchange public key
    pub fn exchange_key(&self) -> ControlResult<ExchangePublicKey> {
        Ok(ExchangePublicKey::from_base64(&read_key(&self.path(EXCHANGE_PUB_FILE))?)?)
    }

    /// Current signing public key
    pub fn signing_public(&self) -> ControlResult<SigningPublicKey> {
        Ok(SigningPublicKey::from_base64(&read_key(&self.path(SIGNING_PUB_FILE))?)?)
    }

    /// Fingerprint of the current signing key
    pub fn signing_fingerprint(&self) -> ControlResult<String> {
        Ok(fingerprint(&self.signing_public()?))
    }

    pub(crate) fn exchange_secret(&self) -> ControlResult<ExchangeSecretKey> {
        Ok(ExchangeSecretKey::from_base64(&read_key(&self.path(EXCHANGE_KEY_FILE))?)?)
    }

    pub(crate) fn signing_secret(&self) -> ControlResult<SigningSecretKey> {
        Ok(SigningSecretKey::from_base64(&read_key(&self.path(SIGNING_KEY_FILE))?)?)
    }

    /// Keys whose signatures are accepted: the trusted signer list plus the
    /// node's own current signing key
    pub fn trusted_signers(&self) -> ControlResult<Vec<SigningPublicKey>> {
        let mut keys = match fs::read_to_string(&self.trusted_signers) {
            Ok(text) => parse_trusted_signers(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        match self.signing_public() {
            Ok(own) => {
                if !keys.contains(&own) {
                    keys.push(own);
                }
            }
            Err(ControlError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(keys)
    }
}

/// One base64 Ed25519 public key per line; `#` starts a comment
pub fn parse_trusted_signers(text: &str) -> Vec<SigningPublicKey> {
    let mut keys = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        match SigningPublicKey::from_base64(line) {
            Ok(key) if !keys.contains(&key) => keys.push(key),
            Ok(_) => {}
            Err(e) => tracing::warn!("Ignoring trusted signer on line {}: {}", idx + 1, e),
        }
    }
    keys
}

fn read_key(path: &Path) -> ControlResult<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

fn write_key(path: &Path, encoded: &str) -> ControlResult<()> {
    fsutil::write_atomic(path, format!("{}\n", encoded).as_bytes())?;
    Ok(())
}

/// `<file>.<token>`, or `<file>.<token>-N` if that name is taken
fn backup_path(current: &Path, token: &str) -> PathBuf {
    let base = format!("{}.{}", current.display(), token);
    let mut candidate = PathBuf::from(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{}-{}", base, n));
        n += 1;
    }
    candidate
}
