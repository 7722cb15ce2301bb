//! CHK (Content Hash Key) encryption
//!
//! Every block is encrypted with AES-256-GCM under a key derived from its
//! own plaintext: `key = SHA256(plaintext)`. Identical plaintext therefore
//! always produces identical ciphertext, which keeps encrypted content
//! deduplicable and content-addressed. Because a key never encrypts more
//! than one distinct plaintext, a fixed nonce is safe.
//!
//! Stored size is always `plaintext + ENCRYPTION_OVERHEAD` (the GCM tag).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use thiserror::Error;

use crate::hash::sha256;

/// 32-byte symmetric key
pub type EncryptionKey = [u8; 32];

/// AES-GCM authentication tag size
pub const TAG_SIZE: usize = 16;

/// Bytes added to every encrypted block
pub const ENCRYPTION_OVERHEAD: usize = TAG_SIZE;

const CHK_NONCE: [u8; 12] = [0u8; 12];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong key or corrupted data)")]
    Decrypt,
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Derive the CHK key for a plaintext
pub fn content_hash(data: &[u8]) -> EncryptionKey {
    sha256(data)
}

fn cipher(key: &EncryptionKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

/// Encrypt with content-derived key. Returns `(ciphertext, key)`.
pub fn encrypt_chk(data: &[u8]) -> Result<(Vec<u8>, EncryptionKey), CryptoError> {
    let key = content_hash(data);
    let ciphertext = cipher(&key)
        .encrypt(Nonce::from_slice(&CHK_NONCE), data)
        .map_err(|_| CryptoError::Encrypt)?;
    Ok((ciphertext, key))
}

/// Decrypt a block produced by [`encrypt_chk`]
pub fn decrypt_chk(data: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CryptoError> {
    if !could_be_encrypted(data.len()) {
        return Err(CryptoError::Decrypt);
    }
    cipher(key)
        .decrypt(Nonce::from_slice(&CHK_NONCE), data)
        .map_err(|_| CryptoError::Decrypt)
}

/// Stored size of an encrypted block of `plaintext_len` bytes
pub fn encrypted_size(plaintext_len: usize) -> usize {
    plaintext_len + ENCRYPTION_OVERHEAD
}

/// Plaintext size of an encrypted block of `stored_len` bytes
pub fn plaintext_size(stored_len: usize) -> usize {
    stored_len.saturating_sub(ENCRYPTION_OVERHEAD)
}

pub fn could_be_encrypted(stored_len: usize) -> bool {
    stored_len >= ENCRYPTION_OVERHEAD
}

/// Random key (link keys, test fixtures)
pub fn generate_key() -> EncryptionKey {
    rand::random()
}

pub fn key_to_hex(key: &EncryptionKey) -> String {
    hex::encode(key)
}

pub fn key_from_hex(s: &str) -> Result<EncryptionKey, CryptoError> {
    let mut key = [0u8; 32];
    hex::decode_to_slice(s.trim(), &mut key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chk_is_deterministic() {
        let (a, key_a) = encrypt_chk(b"same bytes").unwrap();
        let (b, key_b) = encrypt_chk(b"same bytes").unwrap();
        assert_eq!(a, b);
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn test_chk_roundtrip_and_overhead() {
        let data = vec![7u8; 1000];
        let (ciphertext, key) = encrypt_chk(&data).unwrap();
        assert_eq!(ciphertext.len(), encrypted_size(data.len()));
        assert_eq!(plaintext_size(ciphertext.len()), data.len());
        assert_eq!(decrypt_chk(&ciphertext, &key).unwrap(), data);
    }

    #[test]
    fn test_wrong_key_fails() {
        let (ciphertext, _) = encrypt_chk(b"secret").unwrap();
        let wrong = generate_key();
        assert_eq!(decrypt_chk(&ciphertext, &wrong), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_short_input_fails() {
        assert_eq!(decrypt_chk(&[1, 2, 3], &[0u8; 32]), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_key_hex() {
        let key = generate_key();
        assert_eq!(key_from_hex(&key_to_hex(&key)).unwrap(), key);
        assert!(key_from_hex("abcd").is_err());
    }
}
