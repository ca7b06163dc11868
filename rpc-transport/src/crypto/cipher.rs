// Copyright (c) 2024 Botho Foundation

//! OpenSSH-style ChaCha20-Poly1305 packet cipher.
//!
//! This is the `chacha20-poly1305@openssh.com` construction used by BIP151,
//! not the IETF RFC7539 AEAD. The two produce different bytes for the same
//! inputs and must not be mixed.
//!
//! # Layout
//!
//! ```text
//! ┌───────────────┬──────────────────────────┬──────────────┐
//! │ enc len (4)   │ enc payload (len bytes)  │ tag (16)     │
//! │ length key    │ payload key, block 1..   │ Poly1305     │
//! └───────────────┴──────────────────────────┴──────────────┘
//! ```
//!
//! - Both ChaCha20 instances use the 64-bit sequence number as the nonce
//!   (little endian, original 64-bit-nonce ChaCha20)
//! - The Poly1305 key is the first 32 bytes of payload-key block 0
//! - The tag covers the encrypted length and the encrypted payload

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20Legacy;
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Size of the Poly1305 authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Size of the encrypted length field in bytes.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Size of one ChaCha20 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of one ChaCha20 block in bytes.
const BLOCK_SIZE: u64 = 64;

/// Key pair for one direction of the channel.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKeys {
    /// Encrypts the payload and keys Poly1305.
    pub payload: [u8; KEY_SIZE],
    /// Encrypts the 4-byte length field only.
    pub length: [u8; KEY_SIZE],
}

impl CipherKeys {
    pub fn new(payload: [u8; KEY_SIZE], length: [u8; KEY_SIZE]) -> Self {
        Self { payload, length }
    }
}

fn nonce(seq: u64) -> [u8; 8] {
    seq.to_le_bytes()
}

fn length_cipher(keys: &CipherKeys, seq: u64) -> ChaCha20Legacy {
    ChaCha20Legacy::new(&keys.length.into(), &nonce(seq).into())
}

/// Returns the payload cipher positioned at block 1 and the Poly1305 key.
fn payload_cipher(keys: &CipherKeys, seq: u64) -> (ChaCha20Legacy, [u8; 32]) {
    let mut cipher = ChaCha20Legacy::new(&keys.payload.into(), &nonce(seq).into());
    let mut poly_key = [0u8; 32];
    cipher.apply_keystream(&mut poly_key);
    cipher.seek(BLOCK_SIZE);
    (cipher, poly_key)
}

fn compute_tag(poly_key: &mut [u8; 32], data: &[u8]) -> [u8; TAG_SIZE] {
    let mac = Poly1305::new(&(*poly_key).into());
    poly_key.zeroize();
    mac.compute_unpadded(data).into()
}

/// Encrypt `[len:4][payload]` in place and append the tag.
///
/// `packet` must start with the 4-byte little-endian length field.
pub fn seal(keys: &CipherKeys, seq: u64, packet: &mut Vec<u8>) -> Result<(), CryptoError> {
    if packet.len() < LENGTH_FIELD_SIZE {
        return Err(CryptoError::CiphertextTooShort(packet.len()));
    }

    length_cipher(keys, seq).apply_keystream(&mut packet[..LENGTH_FIELD_SIZE]);

    let (mut cipher, mut poly_key) = payload_cipher(keys, seq);
    cipher.apply_keystream(&mut packet[LENGTH_FIELD_SIZE..]);

    let tag = compute_tag(&mut poly_key, packet);
    packet.extend_from_slice(&tag);
    Ok(())
}

/// Decrypt only the length field of a sealed packet.
pub fn open_length(keys: &CipherKeys, seq: u64, header: &[u8]) -> Result<u32, CryptoError> {
    if header.len() < LENGTH_FIELD_SIZE {
        return Err(CryptoError::CiphertextTooShort(header.len()));
    }
    let mut len = [0u8; LENGTH_FIELD_SIZE];
    len.copy_from_slice(&header[..LENGTH_FIELD_SIZE]);
    length_cipher(keys, seq).apply_keystream(&mut len);
    Ok(u32::from_le_bytes(len))
}

/// Verify and decrypt a sealed packet, returning `[len:4][payload]`.
///
/// The tag is checked before any payload byte is decrypted.
pub fn open(keys: &CipherKeys, seq: u64, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < LENGTH_FIELD_SIZE + TAG_SIZE {
        return Err(CryptoError::CiphertextTooShort(sealed.len()));
    }

    let (body, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
    let declared = open_length(keys, seq, body)? as usize;
    if declared != body.len() - LENGTH_FIELD_SIZE {
        return Err(CryptoError::AuthenticationFailed);
    }

    let (mut cipher, mut poly_key) = payload_cipher(keys, seq);
    let expected = compute_tag(&mut poly_key, body);
    if !bool::from(expected[..].ct_eq(tag)) {
        return Err(CryptoError::AuthenticationFailed);
    }

    let mut plain = body.to_vec();
    plain[..LENGTH_FIELD_SIZE].copy_from_slice(&(declared as u32).to_le_bytes());
    cipher.apply_keystream(&mut plain[LENGTH_FIELD_SIZE..]);
    Ok(plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> CipherKeys {
        CipherKeys::new([1u8; 32], [2u8; 32])
    }

    fn packet(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_seal_open_round_trip() {
        let plain = packet(b"hello indexer");
        let mut sealed = plain.clone();
        seal(&keys(), 7, &mut sealed).unwrap();

        assert_eq!(sealed.len(), plain.len() + TAG_SIZE);
        assert_ne!(&sealed[..plain.len()], plain.as_slice());
        assert_eq!(open(&keys(), 7, &sealed).unwrap(), plain);
    }

    #[test]
    fn test_open_length_only() {
        let mut sealed = packet(&[9u8; 100]);
        seal(&keys(), 3, &mut sealed).unwrap();
        assert_eq!(open_length(&keys(), 3, &sealed[..4]).unwrap(), 100);
    }

    #[test]
    fn test_wrong_sequence_fails() {
        let mut sealed = packet(b"data");
        seal(&keys(), 1, &mut sealed).unwrap();
        assert_eq!(
            open(&keys(), 2, &sealed),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_every_bit_flip_detected() {
        let mut sealed = packet(b"tamper");
        seal(&keys(), 0, &mut sealed).unwrap();

        for byte in 0..sealed.len() {
            for bit in 0..8 {
                let mut corrupted = sealed.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    open(&keys(), 0, &corrupted).is_err(),
                    "flip at byte {byte} bit {bit} not detected"
                );
            }
        }
    }

    #[test]
    fn test_empty_payload() {
        let mut sealed = packet(&[]);
        seal(&keys(), 11, &mut sealed).unwrap();
        assert_eq!(open(&keys(), 11, &sealed).unwrap(), packet(&[]));
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(
            open(&keys(), 0, &[0u8; 19]),
            Err(CryptoError::CiphertextTooShort(19))
        );
        let mut short = vec![0u8; 2];
        assert!(seal(&keys(), 0, &mut short).is_err());
    }
}
