//! Cryptographic backend abstraction for bundle exchange
//!
//! Bundles are sealed to a recipient's X25519 exchange key and carry a
//! detached Ed25519 signature over the sealed bytes. The operations live
//! behind a trait so a hardware-backed implementation can be swapped in.

use crate::types::{
    BundleSignature, ExchangePublicKey, ExchangeSecretKey, KeyError, SigningPublicKey,
    SigningSecretKey,
};
use sha2::{Digest, Sha256};

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum CryptoError {
    /// Key generation failed
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Sealing (encryption) failed
    #[error("Encryption failed: {0}")]
    Seal(String),

    /// Opening (decryption) failed: wrong key, tampered or truncated input
    #[error("Decryption failed: {0}")]
    Open(String),

    /// Verification could not be performed
    #[error("Signature verification failed: {0}")]
    Verification(String),

    /// Key error
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    /// Generic internal error
    #[error("Internal crypto error: {0}")]
    Internal(String),
}

/// Trait for pluggable exchange crypto backends
pub trait ExchangeCrypto: Send + Sync {
    /// Returns the name of this backend
    fn name(&self) -> &'static str;

    // ========================================================================
    // Encryption
    // ========================================================================

    /// Generate an X25519 exchange key pair
    fn exchange_keygen(&self) -> CryptoResult<(ExchangePublicKey, ExchangeSecretKey)>;

    /// Derive the public half of an exchange key
    fn exchange_public(&self, secret: &ExchangeSecretKey) -> ExchangePublicKey;

    /// Seal `plaintext` so that only the holder of `recipient`'s secret can open it
    fn seal(&self, recipient: &ExchangePublicKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Open a sealed payload with the local exchange secret
    fn open(&self, secret: &ExchangeSecretKey, sealed: &[u8]) -> CryptoResult<Vec<u8>>;

    // ========================================================================
    // Signatures
    // ========================================================================

    /// Generate an Ed25519 signing key pair
    fn signing_keygen(&self) -> CryptoResult<(SigningPublicKey, SigningSecretKey)>;

    /// Derive the public half of a signing key
    fn signing_public(&self, secret: &SigningSecretKey) -> SigningPublicKey;

    /// Produce a detached signature over `msg`
    fn sign(&self, secret: &SigningSecretKey, msg: &[u8]) -> CryptoResult<BundleSignature>;

    /// Verify a detached signature
    ///
    /// Returns `Ok(false)` for a well-formed but non-matching signature.
    fn verify(
        &self,
        public: &SigningPublicKey,
        msg: &[u8],
        signature: &BundleSignature,
    ) -> CryptoResult<bool>;
}

/// Short, stable identifier for a signing key: hex of the first 8 bytes of
/// its SHA-256 digest.
pub fn fingerprint(public: &SigningPublicKey) -> String {
    let digest = Sha256::digest(public.as_bytes());
    hex::encode(&digest[..8])
}

/// Select the best available crypto backend
pub fn select_backend() -> Box<dyn ExchangeCrypto> {
    #[cfg(feature = "software-backend")]
    {
        Box::new(super::software::SoftwareBackend::new())
    }

    #[cfg(not(feature = "software-backend"))]
    {
        compile_error!("At least one crypto backend must be enabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let key = SigningPublicKey([3u8; 32]);
        let fp = fingerprint(&key);
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, fingerprint(&key));
        assert_ne!(fp, fingerprint(&SigningPublicKey([4u8; 32])));
    }
}
