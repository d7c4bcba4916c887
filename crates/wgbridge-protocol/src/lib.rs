//! wgbridge protocol: configuration model, manifests and exchange crypto
//!
//! This crate holds everything about wgbridge that does not touch the host:
//!
//! - **Configuration model**: parse `wg-quick` style text into a
//!   [`ConfigSummary`], validate fields, detect overlapping peer addresses.
//! - **Manifests**: the metadata record inside an exchange bundle, with
//!   SHA-256 payload checksums.
//! - **Exchange crypto**: the pluggable [`ExchangeCrypto`] backend that seals
//!   bundles to a recipient's X25519 key and signs them with Ed25519.
//!
//! # Example
//!
//! ```
//! use wgbridge_protocol::{Parser, ConfigValidator};
//!
//! let text = "[Interface]\nPrivateKey = X\n\n[Peer]\nPublicKey = Y\nAllowedIPs = 10.0.0.2/32";
//! let summary = Parser::new(true).parse(text).unwrap();
//! assert_eq!(summary.peers.len(), 1);
//!
//! // "X" is not a real key, so semantic validation refuses it
//! assert!(ConfigValidator::new(true).validate(&summary).is_err());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod crypto;
pub mod manifest;
pub mod software;
pub mod types;

// Re-exports
pub use config::{
    detect_ip_conflicts, validate_interface_name, validate_ips, ConfigError, ConfigSummary,
    ConfigValidator, Parser,
};
pub use crypto::{fingerprint, select_backend, CryptoError, CryptoResult, ExchangeCrypto};
pub use manifest::{checksum_matches, sha256_hex, Manifest, ManifestError, ManifestValidator};
pub use software::SoftwareBackend;
pub use types::{
    BundleSignature, ExchangePublicKey, ExchangeSecretKey, KeyError, SigningPublicKey,
    SigningSecretKey,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
