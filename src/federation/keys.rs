//! Actor key material
//!
//! Each local actor owns one RSA keypair. The private key is stored as
//! PKCS#1 PEM and the public key as SPKI PEM; the exact PEM text read from
//! disk is kept so a load/save cycle reproduces it byte for byte.

use std::fmt;
use std::sync::Arc;

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::AppError;

/// Default modulus size for newly created actors
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Fragment appended to an actor IRI to name its key
pub const KEY_ID_FRAGMENT: &str = "#main-key";

/// Public key identifier advertised for an actor
pub fn key_id_for(actor_iri: &str) -> String {
    format!("{}{}", actor_iri, KEY_ID_FRAGMENT)
}

/// An actor's RSA keypair together with its stored PEM encodings
#[derive(Clone)]
pub struct KeyRing {
    private_key: Arc<RsaPrivateKey>,
    private_pem: String,
    public_pem: String,
}

impl KeyRing {
    /// Generate a fresh keypair with a `bits`-bit modulus.
    ///
    /// Actors are created with [`DEFAULT_KEY_BITS`] unless configured otherwise.
    pub fn generate_with_bits(bits: usize) -> Result<Self, AppError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("key generation failed: {}", e)))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| AppError::KeyFormat(format!("private key encoding failed: {}", e)))?
            .to_string();
        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::KeyFormat(format!("public key encoding failed: {}", e)))?;

        Ok(Self {
            private_key: Arc::new(private_key),
            private_pem,
            public_pem,
        })
    }

    /// Parse stored key material.
    ///
    /// Accepts PKCS#1 or PKCS#8 private keys and SPKI or PKCS#1 public keys.
    /// Fails if either block is corrupt or the two keys do not belong together.
    pub fn from_pem(public_pem: &str, private_pem: &str) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(private_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(private_pem))
            .map_err(|e| AppError::KeyFormat(format!("invalid private key: {}", e)))?;
        let public_key = parse_public_key(public_pem)?;

        if RsaPublicKey::from(&private_key) != public_key {
            return Err(AppError::KeyFormat(
                "public key does not match private key".to_string(),
            ));
        }

        Ok(Self {
            private_key: Arc::new(private_key),
            private_pem: private_pem.to_string(),
            public_pem: public_pem.to_string(),
        })
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_pem
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Signing handle bound to `key_id`.
    pub fn signer(&self, key_id: impl Into<String>) -> Signer {
        Signer {
            key_id: key_id.into(),
            signing_key: Arc::new(SigningKey::<Sha256>::new(
                self.private_key.as_ref().clone(),
            )),
        }
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("public_pem", &self.public_pem)
            .finish_non_exhaustive()
    }
}

/// Signs request strings on behalf of one actor key
#[derive(Clone)]
pub struct Signer {
    key_id: String,
    signing_key: Arc<SigningKey<Sha256>>,
}

impl Signer {
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// RSASSA-PKCS1-v1_5 over SHA-256
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        self.signing_key
            .sign_with_rng(&mut rng, message)
            .to_bytes()
            .into_vec()
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Parse a PEM public key as SPKI, falling back to PKCS#1.
pub fn parse_public_key(public_pem: &str) -> Result<RsaPublicKey, AppError> {
    RsaPublicKey::from_public_key_pem(public_pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_pem))
        .map_err(|e| AppError::KeyFormat(format!("invalid public key: {}", e)))
}

pub fn verify_rsa_sha256(
    public_key: &RsaPublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), AppError> {
    let verifier = VerifyingKey::<Sha256>::new(public_key.clone());
    let signature = Pkcs1v15Signature::try_from(signature)
        .map_err(|e| AppError::InvalidSignature(format!("invalid signature format: {}", e)))?;
    verifier
        .verify(message, &signature)
        .map_err(|_| AppError::InvalidSignature("signature verification failed".to_string()))
}
