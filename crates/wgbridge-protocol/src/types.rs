//! Key and signature types used by the bundle exchange

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size constants for X25519
pub mod x25519 {
    /// Public key size in bytes
    pub const PUBLIC_KEY_SIZE: usize = 32;
    /// Secret key size in bytes
    pub const SECRET_KEY_SIZE: usize = 32;
}

/// Size constants for Ed25519
pub mod ed25519 {
    /// Public key size in bytes
    pub const PUBLIC_KEY_SIZE: usize = 32;
    /// Secret key (seed) size in bytes
    pub const SECRET_KEY_SIZE: usize = 32;
    /// Signature size in bytes
    pub const SIGNATURE_SIZE: usize = 64;
}

fn to_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], KeyError> {
    if bytes.len() != N {
        return Err(KeyError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        });
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(bytes);
    Ok(arr)
}

fn decode_base64<const N: usize>(s: &str) -> Result<[u8; N], KeyError> {
    let mut bytes = base64::decode(s.trim()).map_err(|_| KeyError::InvalidEncoding)?;
    let arr = to_array(&bytes);
    bytes.zeroize();
    arr
}

// ============================================================================
// Exchange (encryption) keys
// ============================================================================

/// X25519 public key that bundles are sealed to
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExchangePublicKey(pub [u8; x25519::PUBLIC_KEY_SIZE]);

impl ExchangePublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        to_array(bytes).map(Self)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; x25519::PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        base64::encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_base64(s).map(Self)
    }
}

impl fmt::Debug for ExchangePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExchangePublicKey([{}...])", hex::encode(&self.0[..8]))
    }
}

/// X25519 private key (zeroized on drop)
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExchangeSecretKey(pub [u8; x25519::SECRET_KEY_SIZE]);

impl ExchangeSecretKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        to_array(bytes).map(Self)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; x25519::SECRET_KEY_SIZE] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        base64::encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_base64(s).map(Self)
    }
}

impl fmt::Debug for ExchangeSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExchangeSecretKey([REDACTED])")
    }
}

// ============================================================================
// Signing keys
// ============================================================================

/// Ed25519 verifying key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SigningPublicKey(pub [u8; ed25519::PUBLIC_KEY_SIZE]);

impl SigningPublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        to_array(bytes).map(Self)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; ed25519::PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        base64::encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_base64(s).map(Self)
    }
}

impl fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningPublicKey([{}...])", hex::encode(&self.0[..8]))
    }
}

/// Ed25519 signing seed (zeroized on drop)
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningSecretKey(pub [u8; ed25519::SECRET_KEY_SIZE]);

impl SigningSecretKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        to_array(bytes).map(Self)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; ed25519::SECRET_KEY_SIZE] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        base64::encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_base64(s).map(Self)
    }
}

impl fmt::Debug for SigningSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningSecretKey([REDACTED])")
    }
}

/// Detached Ed25519 signature over an encrypted bundle
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BundleSignature(pub [u8; ed25519::SIGNATURE_SIZE]);

impl BundleSignature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        to_array(bytes).map(Self)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; ed25519::SIGNATURE_SIZE] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        base64::encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_base64(s).map(Self)
    }
}

impl fmt::Debug for BundleSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BundleSignature([{}...])", hex::encode(&self.0[..8]))
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Key-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    /// Invalid key length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },

    /// Invalid encoding
    #[error("Invalid key encoding")]
    InvalidEncoding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_base64_accepts_surrounding_whitespace() {
        let key = ExchangePublicKey([7u8; 32]);
        let encoded = format!("  {}\n", key.to_base64());
        assert_eq!(ExchangePublicKey::from_base64(&encoded).unwrap(), key);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let short = base64::encode([1u8; 16]);
        match SigningPublicKey::from_base64(&short) {
            Err(KeyError::InvalidLength { expected, actual }) => {
                assert_eq!(expected, 32);
                assert_eq!(actual, 16);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            BundleSignature::from_base64("not base64!!"),
            Err(KeyError::InvalidEncoding)
        ));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = ExchangeSecretKey([0xAB; 32]);
        let dbg = format!("{:?}", secret);
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("ab"));
    }
}
