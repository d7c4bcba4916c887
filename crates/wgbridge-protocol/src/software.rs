//! Software exchange backend using dalek and ChaCha20-Poly1305
//!
//! Sealed layout:
//!
//! ```text
//! "WGX1" | ephemeral X25519 public (32) | nonce (12) | ciphertext + tag
//! ```
//!
//! The AEAD key is HKDF-SHA256 over the X25519 shared secret, salted with
//! the ephemeral and recipient public keys. The magic and ephemeral key are
//! bound as associated data.

use crate::crypto::{CryptoError, CryptoResult, ExchangeCrypto};
use crate::types::{
    BundleSignature, ExchangePublicKey, ExchangeSecretKey, SigningPublicKey, SigningSecretKey,
};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};
use zeroize::Zeroize;

/// Magic prefix of a sealed bundle
pub const SEAL_MAGIC: &[u8; 4] = b"WGX1";

/// HKDF info string for bundle keys
const SEAL_INFO: &[u8] = b"wgbridge bundle v1";

const NONCE_SIZE: usize = 12;
const HEADER_SIZE: usize = SEAL_MAGIC.len() + 32 + NONCE_SIZE;

/// Software exchange backend
#[derive(Debug, Default)]
pub struct SoftwareBackend;

impl SoftwareBackend {
    /// Create a new software backend
    pub fn new() -> Self {
        Self
    }

    fn derive_key(
        shared: &[u8; 32],
        ephemeral: &[u8; 32],
        recipient: &[u8; 32],
    ) -> CryptoResult<[u8; 32]> {
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(ephemeral);
        salt[32..].copy_from_slice(recipient);

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
        let mut okm = [0u8; 32];
        hk.expand(SEAL_INFO, &mut okm)
            .map_err(|e| CryptoError::Internal(format!("HKDF expand failed: {}", e)))?;
        Ok(okm)
    }

    fn associated_data(ephemeral: &[u8; 32]) -> [u8; 36] {
        let mut aad = [0u8; 36];
        aad[..4].copy_from_slice(SEAL_MAGIC);
        aad[4..].copy_from_slice(ephemeral);
        aad
    }
}

impl ExchangeCrypto for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software (x25519 + chacha20poly1305 + ed25519)"
    }

    // ========================================================================
    // X25519 sealing
    // ========================================================================

    fn exchange_keygen(&self) -> CryptoResult<(ExchangePublicKey, ExchangeSecretKey)> {
        let secret = X25519Secret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);

        Ok((
            ExchangePublicKey(*public.as_bytes()),
            ExchangeSecretKey(secret.to_bytes()),
        ))
    }

    fn exchange_public(&self, secret: &ExchangeSecretKey) -> ExchangePublicKey {
        let secret = X25519Secret::from(*secret.as_bytes());
        ExchangePublicKey(*X25519PublicKey::from(&secret).as_bytes())
    }

    fn seal(&self, recipient: &ExchangePublicKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let ephemeral = X25519Secret::random_from_rng(OsRng);
        let ephemeral_public = *X25519PublicKey::from(&ephemeral).as_bytes();
        let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(*recipient.as_bytes()));
        if !shared.was_contributory() {
            return Err(CryptoError::Seal(
                "recipient key produces a non-contributory shared secret".into(),
            ));
        }

        let mut key = Self::derive_key(shared.as_bytes(), &ephemeral_public, recipient.as_bytes())?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let aad = Self::associated_data(&ephemeral_public);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::Seal(format!("AEAD encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        out.extend_from_slice(SEAL_MAGIC);
        out.extend_from_slice(&ephemeral_public);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, secret: &ExchangeSecretKey, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        if sealed.len() < HEADER_SIZE {
            return Err(CryptoError::Open(format!(
                "sealed payload too short ({} bytes)",
                sealed.len()
            )));
        }
        if &sealed[..4] != SEAL_MAGIC {
            return Err(CryptoError::Open("not a sealed bundle".into()));
        }

        let mut ephemeral_public = [0u8; 32];
        ephemeral_public.copy_from_slice(&sealed[4..36]);
        let nonce = &sealed[36..HEADER_SIZE];
        let ciphertext = &sealed[HEADER_SIZE..];

        let local = X25519Secret::from(*secret.as_bytes());
        let local_public = *X25519PublicKey::from(&local).as_bytes();
        let shared = local.diffie_hellman(&X25519PublicKey::from(ephemeral_public));
        if !shared.was_contributory() {
            return Err(CryptoError::Open("non-contributory ephemeral key".into()));
        }

        let mut key = Self::derive_key(shared.as_bytes(), &ephemeral_public, &local_public)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();

        let aad = Self::associated_data(&ephemeral_public);
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Open("authentication failed (wrong key or corrupted data)".into()))
    }

    // ========================================================================
    // Ed25519
    // ========================================================================

    fn signing_keygen(&self) -> CryptoResult<(SigningPublicKey, SigningSecretKey)> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = SigningPublicKey(signing_key.verifying_key().to_bytes());

        Ok((public, SigningSecretKey(signing_key.to_bytes())))
    }

    fn signing_public(&self, secret: &SigningSecretKey) -> SigningPublicKey {
        let signing_key = SigningKey::from_bytes(secret.as_bytes());
        SigningPublicKey(signing_key.verifying_key().to_bytes())
    }

    fn sign(&self, secret: &SigningSecretKey, msg: &[u8]) -> CryptoResult<BundleSignature> {
        let signing_key = SigningKey::from_bytes(secret.as_bytes());
        let signature: Signature = signing_key.sign(msg);
        Ok(BundleSignature(signature.to_bytes()))
    }

    fn verify(
        &self,
        public: &SigningPublicKey,
        msg: &[u8],
        signature: &BundleSignature,
    ) -> CryptoResult<bool> {
        let verifying_key = VerifyingKey::from_bytes(public.as_bytes())
            .map_err(|e| CryptoError::Verification(format!("Invalid public key: {}", e)))?;

        let sig = Signature::from_bytes(signature.as_bytes());

        match verifying_key.verify(msg, &sig) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}
