//! Byte codecs applied to serialized shard content before it hits disk.
//!
//! A shard is either plaintext ([`PlainCodec`]) or encrypted
//! ([`EncryptedCodec`]); the choice is made per shard, never per document.
//!
//! Encrypted files hold `base64(nonce || ciphertext)` where the nonce is a
//! fresh random 96-bit AES-GCM nonce for every write.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Length of the nonce prefixed to every encrypted payload.
pub const NONCE_LEN: usize = 12;
/// Length of the AES-GCM authentication tag.
const TAG_LEN: usize = 16;

/// Converts serialized shard bytes to and from their stored form.
pub trait ShardCodec {
    /// Stored form of `plain`.
    fn encode(&self, plain: &[u8]) -> Result<Vec<u8>>;

    /// Original bytes of a stored payload. Any failure means the stored
    /// data cannot be trusted.
    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>>;

    fn is_encrypted(&self) -> bool;
}

/// Stores bytes unchanged.
pub struct PlainCodec;

impl ShardCodec for PlainCodec {
    fn encode(&self, plain: &[u8]) -> Result<Vec<u8>> {
        Ok(plain.to_vec())
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>> {
        Ok(stored.to_vec())
    }

    fn is_encrypted(&self) -> bool {
        false
    }
}

/// A 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, which must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::encryption(format!("key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(key))
    }

    /// Derive a key from a passphrase with SHA-256.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(key)
    }

    /// A random key.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// AES-256-GCM with a random nonce per payload.
pub struct EncryptedCodec {
    cipher: Aes256Gcm,
}

impl EncryptedCodec {
    pub fn new(key: &EncryptionKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }
}

impl ShardCodec for EncryptedCodec {
    fn encode(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|e| Error::encryption(format!("encryption failed: {}", e)))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(payload).into_bytes())
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(stored)
            .map_err(|_| Error::encryption("payload is not base64 text"))?;
        let payload = STANDARD
            .decode(text.trim())
            .map_err(|e| Error::encryption(format!("invalid base64: {}", e)))?;

        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::encryption(format!(
                "payload too short ({} bytes)",
                payload.len()
            )));
        }

        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::encryption("decryption failed (wrong key or tampered data)"))
    }

    fn is_encrypted(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_codec_is_identity() {
        let codec = PlainCodec;
        assert_eq!(codec.encode(b"{\"a\":1}").unwrap(), b"{\"a\":1}".to_vec());
        assert_eq!(codec.decode(b"{}").unwrap(), b"{}".to_vec());
        assert!(!codec.is_encrypted());
    }

    #[test]
    fn encrypted_round_trip_hides_plaintext() {
        let codec = EncryptedCodec::new(&EncryptionKey::from_passphrase("hunter2"));
        let plain = br#"{"secrets/1":{"pin":"1234"}}"#;

        let stored = codec.encode(plain).unwrap();
        let stored_text = String::from_utf8(stored.clone()).unwrap();
        assert!(!stored_text.contains("pin"));
        assert!(!stored_text.contains("1234"));

        assert_eq!(codec.decode(&stored).unwrap(), plain.to_vec());
        assert!(codec.is_encrypted());
    }

    #[test]
    fn fresh_nonce_per_write() {
        let codec = EncryptedCodec::new(&EncryptionKey::generate());
        let a = codec.encode(b"same").unwrap();
        let b = codec.encode(b"same").unwrap();
        assert_ne!(a, b);

        let a = STANDARD.decode(&a).unwrap();
        let b = STANDARD.decode(&b).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn wrong_key_fails() {
        let stored = EncryptedCodec::new(&EncryptionKey::from_passphrase("right"))
            .encode(b"data")
            .unwrap();
        let result = EncryptedCodec::new(&EncryptionKey::from_passphrase("wrong")).decode(&stored);
        assert!(matches!(result, Err(Error::Encryption { .. })));
    }

    #[test]
    fn garbage_fails() {
        let codec = EncryptedCodec::new(&EncryptionKey::generate());
        assert!(codec.decode(b"not base64 !!").is_err());
        assert!(codec.decode(STANDARD.encode([0u8; 8]).as_bytes()).is_err());
        assert!(codec.decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn key_from_slice_checks_length() {
        assert!(EncryptionKey::from_slice(&[0u8; 31]).is_err());
        let key = EncryptionKey::from_slice(&[7u8; 32]).unwrap();
        assert_eq!(key, EncryptionKey::from_bytes([7u8; 32]));
        assert_eq!(format!("{:?}", key), "EncryptionKey(..)");
    }

    #[test]
    fn passphrase_derivation_is_stable() {
        assert_eq!(
            EncryptionKey::from_passphrase("a"),
            EncryptionKey::from_passphrase("a")
        );
        assert_ne!(
            EncryptionKey::from_passphrase("a"),
            EncryptionKey::from_passphrase("b")
        );
    }
}
