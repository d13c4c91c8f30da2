//! Public keys, signatures, and the signing façade.
//!
//! Identity is the DER encoding of an ECDSA (P-256) verifying key, matching
//! spec §3's "PublicKey: DER-encoded ECDSA verifying key; identity is `der`
//! bytes." Signing is deterministic (RFC6979), matching the prototype's
//! `ecdsa` library default.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rand_core::OsRng;

use crate::error::CoreError;

/// DER-encoded ECDSA verifying key. Equality and hashing are by DER bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PublicKey {
    der: Vec<u8>,
}

impl PublicKey {
    pub fn from_der(der: Vec<u8>) -> Self {
        PublicKey { der }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, CoreError> {
        VerifyingKey::from_public_key_der(&self.der)
            .map_err(|_| CoreError::Verify("malformed public key".into()))
    }

    fn from_verifying_key(vk: &VerifyingKey) -> Self {
        let der = vk
            .to_public_key_der()
            .expect("P-256 verifying key always DER-encodes")
            .as_bytes()
            .to_vec();
        PublicKey { der }
    }
}

/// Opaque ECDSA signature bytes (DER-encoded signature value).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Signature(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Wraps a private key and signs objects on behalf of its owner.
pub struct User {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl User {
    /// Generates a fresh P-256 keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let public_key = PublicKey::from_verifying_key(signing_key.verifying_key());
        User {
            signing_key,
            public_key,
        }
    }

    /// Builds a user from a raw PKCS#8 DER-encoded private key, as accepted
    /// by the CLI's `-k` flag.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CoreError> {
        let signing_key = SigningKey::from_pkcs8_der(der)
            .map_err(|_| CoreError::RawFormat("malformed private key".into()))?;
        let public_key = PublicKey::from_verifying_key(signing_key.verifying_key());
        Ok(User {
            signing_key,
            public_key,
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// PKCS#8 DER encoding of the private key, as printed by the CLI so a
    /// session's key can be reused later via `-k`.
    pub fn private_key_der(&self) -> Vec<u8> {
        self.signing_key
            .to_pkcs8_der()
            .expect("P-256 signing key always DER-encodes")
            .as_bytes()
            .to_vec()
    }

    /// Deterministically signs `unsigned_raw` bytes, returning `(public_key,
    /// signature)` ready to attach via `SignedObject::sign`.
    pub fn sign_bytes(&self, unsigned_raw: &[u8]) -> (PublicKey, Signature) {
        let sig: EcdsaSignature = self.signing_key.sign(unsigned_raw);
        (self.public_key.clone(), Signature(sig.to_der().as_bytes().to_vec()))
    }
}

/// Verifies `signature` over `unsigned_raw` under `public_key`.
pub fn verify(public_key: &PublicKey, unsigned_raw: &[u8], signature: &Signature) -> Result<(), CoreError> {
    let vk = public_key.verifying_key()?;
    let sig = EcdsaSignature::from_der(signature.as_bytes())
        .map_err(|_| CoreError::Verify("wrong signature".into()))?;
    vk.verify(unsigned_raw, &sig)
        .map_err(|_| CoreError::Verify("wrong signature".into()))
}
