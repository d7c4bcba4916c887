//! Bundle file format
//!
//! A bundle is two sibling files in the inbox or outbox:
//!
//! - `<name>.wgx`: a sealed ustar archive holding `manifest.json`,
//!   `config.conf` and optional `meta/*` entries
//! - `<name>.wgx.sig`: a JSON detached signature over the sealed bytes

use crate::error::{ControlError, ControlResult};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use wgbridge_protocol::{
    fingerprint, BundleSignature, ExchangeCrypto, Manifest, SigningPublicKey, SigningSecretKey,
};

/// Bundle file extension
pub const BUNDLE_EXT: &str = "wgx";

/// Detached signature extension, appended to the bundle file name
pub const SIG_EXT: &str = "sig";

/// Only supported signature algorithm
pub const SIGNATURE_ALGORITHM: &str = "ed25519";

/// Archive entry holding the manifest
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Archive entry holding the configuration text
pub const CONFIG_ENTRY: &str = "config.conf";

/// Prefix of auxiliary archive entries
pub const META_PREFIX: &str = "meta/";

/// Upper bound on any single archive entry
pub const MAX_ENTRY_SIZE: u64 = 4 * 1024 * 1024;

/// Whether `path` names a bundle (not its signature)
pub fn is_bundle_path(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == BUNDLE_EXT)
}

/// Path of the detached signature for `bundle`
pub fn signature_path(bundle: &Path) -> PathBuf {
    let mut name = bundle.as_os_str().to_os_string();
    name.push(".");
    name.push(SIG_EXT);
    PathBuf::from(name)
}

/// Bundle a signature file belongs to, if `path` is one
pub fn bundle_for_signature(path: &Path) -> Option<PathBuf> {
    if path.extension().map_or(true, |ext| ext != SIG_EXT) {
        return None;
    }
    let bundle = path.with_extension("");
    is_bundle_path(&bundle).then_some(bundle)
}

/// Bundles resident in `dir`, sorted by name; a missing directory is empty
pub fn list_bundles(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut bundles = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && is_bundle_path(&path) {
            bundles.push(path);
        }
    }
    bundles.sort();
    Ok(bundles)
}

/// Decrypted bundle contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleContents {
    /// Validated manifest
    pub manifest: Manifest,
    /// Configuration payload
    pub config: Vec<u8>,
    /// Auxiliary files, names relative to `meta/`
    pub metadata: Vec<(String, Vec<u8>)>,
}

/// Check an auxiliary file name (relative to `meta/`)
pub fn validate_meta_name(name: &str) -> ControlResult<()> {
    if name.is_empty() || name.contains('\0') || name.contains('\\') {
        return Err(ControlError::Validation(format!(
            "invalid metadata name {:?}",
            name
        )));
    }
    if name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(ControlError::Validation(format!(
            "metadata name {:?} has empty or relative components",
            name
        )));
    }
    if !Path::new(name)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(ControlError::Validation(format!(
            "metadata name {:?} is not a plain relative path",
            name
        )));
    }
    Ok(())
}

/// Build the archive that gets sealed into a bundle
pub fn pack(
    manifest: &Manifest,
    config: &[u8],
    metadata: &[(String, Vec<u8>)],
) -> ControlResult<Vec<u8>> {
    let manifest_json = manifest.to_json()?;
    let mtime = manifest.timestamp.unwrap_or(0).max(0) as u64;

    let mut builder = tar::Builder::new(Vec::new());
    append(&mut builder, MANIFEST_ENTRY, &manifest_json, mtime)?;
    append(&mut builder, CONFIG_ENTRY, config, mtime)?;
    for (name, data) in metadata {
        validate_meta_name(name)?;
        append(&mut builder, &format!("{}{}", META_PREFIX, name), data, mtime)?;
    }
    Ok(builder.into_inner()?)
}

fn append(
    builder: &mut tar::Builder<Vec<u8>>,
    name: &str,
    data: &[u8],
    mtime: u64,
) -> ControlResult<()> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o600);
    header.set_mtime(mtime);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

/// Unpack a decrypted archive
///
/// A missing manifest, a missing or empty configuration, or an unsafe
/// metadata name is an error. Unknown entries outside `meta/` are ignored.
pub fn unpack(archive: &[u8], strict_manifest: bool) -> ControlResult<BundleContents> {
    let mut manifest = None;
    let mut config = None;
    let mut metadata = Vec::new();

    let mut reader = tar::Archive::new(archive);
    for entry in reader.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        if !kind.is_file() {
            return Err(ControlError::Validation(format!(
                "archive entry {:?} is not a regular file",
                name
            )));
        }
        if entry.size() > MAX_ENTRY_SIZE {
            return Err(ControlError::Validation(format!(
                "archive entry {:?} exceeds {} bytes",
                name, MAX_ENTRY_SIZE
            )));
        }

        let mut data = Vec::with_capacity(entry.size() as usize);
        (&mut entry).take(MAX_ENTRY_SIZE).read_to_end(&mut data)?;

        if name == MANIFEST_ENTRY {
            manifest = Some(Manifest::from_json(&data, strict_manifest)?);
        } else if name == CONFIG_ENTRY {
            config = Some(data);
        } else if let Some(meta) = name.strip_prefix(META_PREFIX) {
            validate_meta_name(meta)?;
            metadata.push((meta.to_string(), data));
        } else {
            tracing::debug!(entry = %name, "ignoring unknown archive entry");
        }
    }

    let manifest =
        manifest.ok_or_else(|| ControlError::Validation("bundle has no manifest".into()))?;
    let config = match config {
        Some(c) if !c.is_empty() => c,
        _ => {
            return Err(ControlError::Validation(
                "bundle has no configuration payload".into(),
            ))
        }
    };

    Ok(BundleContents {
        manifest,
        config,
        metadata,
    })
}

// ─── Detached signatures ─────────────────────────────────────────────────

/// On-disk detached signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureFile {
    /// Always `ed25519`
    pub algorithm: String,
    /// Fingerprint of the signing key
    pub signer: String,
    /// Base64 signature over the sealed bundle bytes
    pub signature: String,
}

impl SignatureFile {
    /// Sign `data` with the local signing key
    pub fn sign(
        backend: &dyn ExchangeCrypto,
        secret: &SigningSecretKey,
        data: &[u8],
    ) -> ControlResult<Self> {
        let public = backend.signing_public(secret);
        let signature = backend.sign(secret, data)?;
        Ok(Self {
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            signer: fingerprint(&public),
            signature: signature.to_base64(),
        })
    }

    /// Read a signature file
    pub fn read(path: &Path) -> ControlResult<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| {
            ControlError::Verification(format!("malformed signature {}: {}", path.display(), e))
        })
    }

    /// Serialized form
    pub fn to_json(&self) -> ControlResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| ControlError::Validation(format!("cannot encode signature: {}", e)))
    }

    /// Verify against the trusted signer set, returning the matching key
    pub fn verify(
        &self,
        backend: &dyn ExchangeCrypto,
        trusted: &[SigningPublicKey],
        data: &[u8],
    ) -> ControlResult<SigningPublicKey> {
        if self.algorithm != SIGNATURE_ALGORITHM {
            return Err(ControlError::Verification(format!(
                "unsupported signature algorithm {:?}",
                self.algorithm
            )));
        }
        let signature = BundleSignature::from_base64(&self.signature)
            .map_err(|e| ControlError::Verification(format!("bad signature encoding: {}", e)))?;

        let signer = trusted
            .iter()
            .find(|key| fingerprint(key) == self.signer)
            .ok_or_else(|| {
                ControlError::Verification(format!("signer {} is not trusted", self.signer))
            })?;

        if backend.verify(signer, data, &signature)? {
            Ok(*signer)
        } else {
            Err(ControlError::Verification(format!(
                "signature by {} does not match bundle",
                self.signer
            )))
        }
    }
}
