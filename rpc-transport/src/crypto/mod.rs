// Copyright (c) 2024 Botho Foundation

//! Elliptic-curve and hashing primitives for the BIP150/151 transport.
//!
//! # Overview
//!
//! All secp256k1 work (ephemeral key generation, ECDH, identity signatures)
//! goes through an explicit [`CryptoContext`] that is built once at startup
//! and handed to every session and handshake state machine. There is no
//! process-wide context.
//!
//! # Security Properties
//!
//! - ECDH returns the raw x-coordinate of the shared point, not a hash of
//!   it, so the derived keys match other BIP151 implementations
//! - Identity signatures are deterministic (RFC6979) and low-S normalized
//! - Secret material is wrapped in [`Zeroizing`] or zeroized on drop

pub mod cipher;

use std::fmt;
use std::sync::Arc;

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Size of a compressed secp256k1 public key in bytes.
pub const PUBKEY_SIZE: usize = 33;

/// Size of a secp256k1 private key in bytes.
pub const PRIVKEY_SIZE: usize = 32;

/// Size of a compact ECDSA signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Version prefix of a BIP150 identity fingerprint.
const FINGERPRINT_PREFIX: [u8; 3] = [0x0f, 0xff, 0x01];

/// A validated, compressed secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBKEY_SIZE]);

impl PublicKey {
    /// Parse and validate a 33-byte compressed key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBKEY_SIZE || !matches!(bytes[0], 0x02 | 0x03) {
            return Err(CryptoError::InvalidPublicKey);
        }
        k256::PublicKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;

        let mut key = [0u8; PUBKEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Parse a hex-encoded compressed key.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBKEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn to_k256(self) -> Result<k256::PublicKey, CryptoError> {
        k256::PublicKey::from_sec1_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)
    }

    fn from_k256(key: &k256::PublicKey) -> Self {
        let point = key.to_encoded_point(true);
        let mut out = [0u8; PUBKEY_SIZE];
        out.copy_from_slice(point.as_bytes());
        Self(out)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A long-term identity keypair.
#[derive(Clone)]
pub struct IdentityKeypair {
    secret: k256::SecretKey,
    public: PublicKey,
}

impl IdentityKeypair {
    /// Generate a fresh identity key.
    pub fn generate(ctx: &CryptoContext) -> Self {
        Self::from_secret(ctx.random_secret())
    }

    /// Build a keypair from raw private key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PRIVKEY_SIZE {
            return Err(CryptoError::InvalidPrivateKey);
        }
        let secret =
            k256::SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self::from_secret(secret))
    }

    /// Build a keypair from a hex-encoded private key.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes =
            Zeroizing::new(hex::decode(s.trim()).map_err(|_| CryptoError::InvalidPrivateKey)?);
        Self::from_bytes(&bytes)
    }

    fn from_secret(secret: k256::SecretKey) -> Self {
        let public = PublicKey::from_k256(&secret.public_key());
        Self { secret, public }
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Raw private key bytes.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; PRIVKEY_SIZE]> {
        let mut out = Zeroizing::new([0u8; PRIVKEY_SIZE]);
        out.copy_from_slice(&self.secret.to_bytes());
        out
    }

    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.secret_bytes().as_slice()))
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKeypair {{ public: {} }}", self.public)
    }
}

/// A single-use ECDH key for one session direction.
///
/// The secret is consumed by the key agreement and cannot be reused.
pub struct EphemeralKey {
    secret: Option<k256::SecretKey>,
    public: PublicKey,
}

impl EphemeralKey {
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Whether the secret half has already been consumed.
    pub fn is_consumed(&self) -> bool {
        self.secret.is_none()
    }

    /// Drop the secret half without using it.
    pub fn cleanse(&mut self) {
        self.secret = None;
    }
}

/// Explicit secp256k1/hash context shared by sessions and state machines.
///
/// Cloning is cheap; clones share the random source.
#[derive(Clone)]
pub struct CryptoContext {
    rng: Arc<Mutex<StdRng>>,
}

impl CryptoContext {
    /// Create a context seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Create a deterministic context. Intended for tests.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    fn random_secret(&self) -> k256::SecretKey {
        let mut rng = self.rng.lock();
        loop {
            let mut bytes = Zeroizing::new([0u8; PRIVKEY_SIZE]);
            rng.fill_bytes(bytes.as_mut_slice());
            // Rejection is astronomically unlikely (zero or >= curve order).
            if let Ok(secret) = k256::SecretKey::from_slice(bytes.as_slice()) {
                return secret;
            }
        }
    }

    /// Generate an ephemeral ECDH key.
    pub fn ephemeral_key(&self) -> EphemeralKey {
        let secret = self.random_secret();
        let public = PublicKey::from_k256(&secret.public_key());
        EphemeralKey {
            secret: Some(secret),
            public,
        }
    }

    /// Run ECDH and return the x-coordinate of the shared point.
    ///
    /// Consumes the secret half of `key`.
    pub fn ecdh(
        &self,
        key: &mut EphemeralKey,
        peer: &PublicKey,
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let secret = key.secret.take().ok_or(CryptoError::KeyAgreement)?;
        let peer = peer.to_k256()?;
        let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());

        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }

    /// Sign a 32-byte digest, returning a compact 64-byte signature.
    pub fn sign(
        &self,
        key: &IdentityKeypair,
        digest: &[u8; 32],
    ) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
        let signing_key = SigningKey::from(&key.secret);
        let signature: Signature = signing_key
            .sign_prehash(digest)
            .map_err(|_| CryptoError::BadSignature)?;

        let mut out = [0u8; SIGNATURE_SIZE];
        out.copy_from_slice(signature.to_bytes().as_slice());
        Ok(out)
    }

    /// Verify a compact signature over a 32-byte digest.
    pub fn verify(
        &self,
        key: &PublicKey,
        digest: &[u8; 32],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::from(&key.to_k256()?);
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::BadSignature)?;
        verifying_key
            .verify_prehash(digest, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }
}

impl Default for CryptoContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CryptoContext")
    }
}

/// Double SHA-256 over the concatenation of `parts`.
pub fn sha256d(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let first = hasher.finalize();
    Sha256::digest(first).into()
}

/// RIPEMD160(SHA256(data)).
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

/// Operator-facing BIP150 fingerprint of an identity key.
pub fn fingerprint(key: &PublicKey) -> String {
    let mut data = Vec::with_capacity(FINGERPRINT_PREFIX.len() + 20);
    data.extend_from_slice(&FINGERPRINT_PREFIX);
    data.extend_from_slice(&hash160(key.as_bytes()));
    bs58::encode(data).with_check().into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_validation() {
        let ctx = CryptoContext::from_seed(1);
        let key = IdentityKeypair::generate(&ctx);
        let bytes = key.public().as_bytes().to_vec();

        assert_eq!(PublicKey::from_bytes(&bytes).unwrap(), key.public());
        assert!(PublicKey::from_bytes(&bytes[..32]).is_err());
        assert!(PublicKey::from_bytes(&[0u8; 33]).is_err());

        let mut uncompressed_tag = bytes.clone();
        uncompressed_tag[0] = 0x04;
        assert!(PublicKey::from_bytes(&uncompressed_tag).is_err());
    }

    #[test]
    fn test_hex_round_trip() {
        let ctx = CryptoContext::from_seed(2);
        let key = IdentityKeypair::generate(&ctx);

        let restored = IdentityKeypair::from_hex(&key.secret_hex()).unwrap();
        assert_eq!(restored.public(), key.public());
        assert_eq!(PublicKey::from_hex(&key.public().to_hex()).unwrap(), key.public());
    }

    #[test]
    fn test_ecdh_agreement() {
        let ctx = CryptoContext::from_seed(3);
        let mut a = ctx.ephemeral_key();
        let mut b = ctx.ephemeral_key();
        let (a_pub, b_pub) = (a.public(), b.public());

        let s1 = ctx.ecdh(&mut a, &b_pub).unwrap();
        let s2 = ctx.ecdh(&mut b, &a_pub).unwrap();
        assert_eq!(*s1, *s2);

        // Secret is single use.
        assert!(a.is_consumed());
        assert_eq!(ctx.ecdh(&mut a, &b_pub), Err(CryptoError::KeyAgreement));
    }

    #[test]
    fn test_sign_and_verify() {
        let ctx = CryptoContext::from_seed(4);
        let key = IdentityKeypair::generate(&ctx);
        let other = IdentityKeypair::generate(&ctx);
        let digest = sha256d(&[b"session"]);

        let sig = ctx.sign(&key, &digest).unwrap();
        assert!(ctx.verify(&key.public(), &digest, &sig).is_ok());
        assert!(ctx.verify(&other.public(), &digest, &sig).is_err());
        assert!(ctx.verify(&key.public(), &sha256d(&[b"other"]), &sig).is_err());
        assert!(ctx.verify(&key.public(), &digest, &[0u8; 64]).is_err());
    }

    #[test]
    fn test_sha256d_concatenates() {
        assert_eq!(sha256d(&[b"ab", b"cd"]), sha256d(&[b"abcd"]));
        let single: [u8; 32] = Sha256::digest(b"abcd").into();
        assert_ne!(sha256d(&[b"abcd"]), single);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let key = IdentityKeypair::from_bytes(&[7u8; 32]).unwrap();
        let fp1 = fingerprint(&key.public());
        let fp2 = fingerprint(&key.public());
        assert_eq!(fp1, fp2);

        let decoded = bs58::decode(&fp1).with_check(None).into_vec().unwrap();
        assert_eq!(&decoded[..3], &FINGERPRINT_PREFIX);
        assert_eq!(&decoded[3..], &hash160(key.public().as_bytes()));

        let other = IdentityKeypair::from_bytes(&[8u8; 32]).unwrap();
        assert_ne!(fingerprint(&other.public()), fp1);
    }
}
