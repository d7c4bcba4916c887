//! Bundle manifest and payload checksums
//!
//! The manifest travels inside a bundle next to the configuration payload
//! and names the target interface plus the SHA-256 of the payload.

use crate::config::validate_interface_name;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Largest manifest document accepted
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Manifest format versions this build understands
pub const SUPPORTED_VERSIONS: [u32; 2] = [1, 2];

/// Version written by this build
pub const CURRENT_VERSION: u32 = 1;

/// Longest `source` accepted
pub const MAX_SOURCE_LEN: usize = 255;

/// How far in the future a timestamp may lie (clock skew allowance)
pub const MAX_CLOCK_SKEW_SECS: i64 = 24 * 60 * 60;

/// Metadata record describing a bundle payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Target interface name
    pub interface: String,
    /// Format version
    pub version: u32,
    /// Lowercase hex SHA-256 of the configuration payload
    pub checksum: String,
    /// Creation time, unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Free-form origin label (usually the exporting host)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Manifest {
    /// Build a current-version manifest for `payload`
    pub fn for_payload(interface: &str, payload: &[u8], source: Option<String>) -> Self {
        Self {
            interface: interface.to_string(),
            version: CURRENT_VERSION,
            checksum: sha256_hex(payload),
            timestamp: Some(chrono::Utc::now().timestamp()),
            source: source.map(|s| sanitize_source(&s)).filter(|s| !s.is_empty()),
        }
    }

    /// Parse and validate a manifest document
    pub fn from_json(data: &[u8], strict: bool) -> Result<Self, ManifestError> {
        if data.len() > MAX_MANIFEST_SIZE {
            return Err(ManifestError::TooLarge(data.len()));
        }
        let manifest: Manifest = serde_json::from_slice(data)?;
        ManifestValidator::new(strict).validate(&manifest)?;
        Ok(manifest)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Check `payload` against the recorded checksum
    pub fn verify_payload(&self, payload: &[u8]) -> Result<(), ManifestError> {
        if payload.is_empty() {
            return Err(ManifestError::EmptyPayload);
        }
        if !checksum_matches(&self.checksum, payload) {
            return Err(ManifestError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual: sha256_hex(payload),
            });
        }
        Ok(())
    }
}

/// Field-level manifest checks
#[derive(Debug, Clone, Copy)]
pub struct ManifestValidator {
    strict: bool,
}

impl ManifestValidator {
    /// Strict mode additionally bounds the timestamp
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Validate every field
    pub fn validate(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        validate_interface_name(&manifest.interface)
            .map_err(|e| ManifestError::Invalid(e.to_string()))?;

        if !SUPPORTED_VERSIONS.contains(&manifest.version) {
            return Err(ManifestError::Invalid(format!(
                "unsupported version {}",
                manifest.version
            )));
        }

        if manifest.checksum.len() != 64
            || !manifest.checksum.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ManifestError::Invalid(
                "checksum must be 64 hexadecimal characters".into(),
            ));
        }

        if let Some(source) = &manifest.source {
            if source.is_empty() || source.len() > MAX_SOURCE_LEN {
                return Err(ManifestError::Invalid(format!(
                    "source must be 1-{} characters",
                    MAX_SOURCE_LEN
                )));
            }
            if !source.bytes().all(|b| (32..=126).contains(&b)) {
                return Err(ManifestError::Invalid(
                    "source contains non-printable characters".into(),
                ));
            }
        }

        if self.strict {
            if let Some(ts) = manifest.timestamp {
                let now = chrono::Utc::now().timestamp();
                if ts <= 0 {
                    return Err(ManifestError::Invalid("timestamp must be positive".into()));
                }
                if ts > now + MAX_CLOCK_SKEW_SECS {
                    return Err(ManifestError::Invalid(
                        "timestamp is too far in the future".into(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Lowercase hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Case-insensitive comparison of a hex checksum against `data`
pub fn checksum_matches(expected: &str, data: &[u8]) -> bool {
    expected.eq_ignore_ascii_case(&sha256_hex(data))
}

/// Keep printable ASCII only, truncated to the manifest limit
pub fn sanitize_source(source: &str) -> String {
    source
        .chars()
        .filter(|c| (' '..='~').contains(c))
        .take(MAX_SOURCE_LEN)
        .collect()
}

/// Manifest errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// Document exceeds [`MAX_MANIFEST_SIZE`]
    #[error("manifest too large: {0} bytes")]
    TooLarge(usize),

    /// Not valid JSON or missing fields
    #[error("malformed manifest: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A field failed validation
    #[error("invalid manifest: {0}")]
    Invalid(String),

    /// Payload missing or empty
    #[error("empty configuration payload")]
    EmptyPayload,

    /// Payload does not hash to the recorded checksum
    #[error("checksum mismatch: manifest {expected}, payload {actual}")]
    ChecksumMismatch {
        /// Checksum recorded in the manifest
        expected: String,
        /// Checksum of the payload received
        actual: String,
    },
}
