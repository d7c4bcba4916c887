//! Control plane error types

use std::io;
use thiserror::Error;
use wgbridge_protocol::{ConfigError, CryptoError, KeyError, ManifestError};

/// Result type for control operations
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur during control operations
#[derive(Debug, Error)]
pub enum ControlError {
    /// Malformed or unsafe input; nothing was changed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Overlapping or duplicate peer addressing; nothing was changed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The interface lock could not be taken
    #[error("Lock error on {interface}: {reason}")]
    Lock {
        /// Interface whose lock failed
        interface: String,
        /// Underlying cause
        reason: String,
    },

    /// The interface lock stayed busy for the whole acquisition window
    #[error("Timed out after {waited_secs}s waiting for lock on {interface}")]
    LockTimeout {
        /// Interface whose lock was busy
        interface: String,
        /// Seconds spent waiting
        waited_secs: u64,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// An external tool failed or exited non-zero
    #[error("{tool} failed: {detail}")]
    ExternalTool {
        /// Tool that failed
        tool: String,
        /// Exit status and sanitized stderr
        detail: String,
    },

    /// An external tool did not finish in time and was killed
    #[error("{tool} timed out after {secs}s")]
    Timeout {
        /// Tool that timed out
        tool: String,
        /// Timeout that elapsed
        secs: u64,
    },

    /// Signature, checksum or post-apply live state did not match
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Restoring the previous configuration failed; disk and live state may disagree
    #[error("Rollback failed for {interface}: {detail}")]
    RollbackFailed {
        /// Interface left in an unknown state
        interface: String,
        /// What went wrong while rolling back
        detail: String,
    },

    /// Cryptographic failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Settings file problem
    #[error("Settings error: {0}")]
    Settings(String),
}

impl ControlError {
    /// Whether the failure left state that could not be restored
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }

    /// Short machine-friendly name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::Lock { .. } | Self::LockTimeout { .. } => "lock",
            Self::Io(_) => "io",
            Self::ExternalTool { .. } => "external_tool",
            Self::Timeout { .. } => "timeout",
            Self::Verification(_) => "verification",
            Self::RollbackFailed { .. } => "rollback_failed",
            Self::Crypto(_) => "crypto",
            Self::Settings(_) => "settings",
        }
    }
}

impl From<ConfigError> for ControlError {
    fn from(err: ConfigError) -> Self {
        if err.is_conflict() {
            Self::Conflict(err.to_string())
        } else {
            Self::Validation(err.to_string())
        }
    }
}

impl From<ManifestError> for ControlError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::ChecksumMismatch { .. } => Self::Verification(err.to_string()),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<KeyError> for ControlError {
    fn from(err: KeyError) -> Self {
        Self::Crypto(CryptoError::Key(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_split_by_kind() {
        let conflict: ControlError = ConfigError::Conflict("10.0.0.1/32".into()).into();
        assert_eq!(conflict.kind(), "conflict");

        let invalid: ControlError = ConfigError::MissingInterface.into();
        assert_eq!(invalid.kind(), "validation");
    }

    #[test]
    fn test_checksum_mismatch_is_verification() {
        let err: ControlError = ManifestError::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert_eq!(err.kind(), "verification");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_rollback_failure_is_fatal() {
        let err = ControlError::RollbackFailed {
            interface: "wg0".into(),
            detail: "rename failed".into(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("wg0"));
    }
}
