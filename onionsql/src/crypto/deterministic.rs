//! Deterministic encryption using AES-SIV for the `Det` onion.
//!
//! AES-SIV (Synthetic IV) produces the same ciphertext for the same plaintext
//! and associated data, so the store can evaluate `=`, `IN` and `GROUP BY`
//! directly on ciphertext. The layer context is the associated data.
//!
//! # Security Warning
//!
//! Deterministic encryption reveals equality patterns within a column, and at
//! the shared `DetJoin` level across columns.

use aes_siv::{
    aead::{Aead, KeyInit, Payload},
    Aes256SivAead,
};
use secrecy::{ExposeSecret, SecretVec};

use crate::error::Error;

/// AES-256-SIV needs a 64-byte key.
pub const SIV_KEY_SIZE: usize = 64;

/// Deterministic cipher using AES-256-SIV.
pub struct DeterministicCipher {
    key: SecretVec<u8>,
}

impl DeterministicCipher {
    /// Creates a cipher over a 64-byte key.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyLength` if the key is not 64 bytes.
    pub fn new(key: SecretVec<u8>) -> Result<Self, Error> {
        if key.expose_secret().len() != SIV_KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: SIV_KEY_SIZE,
                actual: key.expose_secret().len(),
            });
        }
        Ok(Self { key })
    }

    /// Encrypts `plaintext` deterministically, binding it to `aad`.
    ///
    /// # Errors
    ///
    /// Returns `Error::EncryptionFailed` if the cipher rejects the input.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = Aes256SivAead::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::EncryptionFailed(format!("failed to create AES-SIV cipher: {e}")))?;

        cipher
            .encrypt(&Default::default(), Payload { msg: plaintext, aad })
            .map_err(|e| Error::EncryptionFailed(format!("AES-SIV encryption failed: {e}")))
    }

    /// Decrypts a ciphertext produced with the same key and `aad`.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if the ciphertext is corrupted or was
    /// produced under a different key or associated data.
    pub fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = Aes256SivAead::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::DecryptionFailed(format!("failed to create AES-SIV cipher: {e}")))?;

        cipher
            .decrypt(&Default::default(), Payload { msg: ciphertext, aad })
            .map_err(|e| Error::DecryptionFailed(format!("AES-SIV decryption failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> DeterministicCipher {
        DeterministicCipher::new(SecretVec::new(vec![0x42; 64])).unwrap()
    }

    #[test]
    fn test_deterministic_encryption() {
        let c = cipher();
        let ct1 = c.encrypt(b"alice@example.com", b"t|f|DET").unwrap();
        let ct2 = c.encrypt(b"alice@example.com", b"t|f|DET").unwrap();

        assert_eq!(ct1, ct2, "encryption must be deterministic");
        assert_eq!(c.decrypt(&ct1, b"t|f|DET").unwrap(), b"alice@example.com");
    }

    #[test]
    fn test_different_aad_different_ciphertexts() {
        let c = cipher();
        let ct1 = c.encrypt(b"alice", b"t|f1|DET").unwrap();
        let ct2 = c.encrypt(b"alice", b"t|f2|DET").unwrap();

        assert_ne!(ct1, ct2);
        assert!(c.decrypt(&ct1, b"t|f2|DET").is_err(), "wrong context must fail");
    }

    #[test]
    fn test_corrupted_ciphertext_fails() {
        let c = cipher();
        let mut ct = c.encrypt(b"alice", b"aad").unwrap();
        ct[0] ^= 0xFF;

        assert!(matches!(c.decrypt(&ct, b"aad"), Err(Error::DecryptionFailed(_))));
    }

    #[test]
    fn test_empty_plaintext() {
        let c = cipher();
        let ct = c.encrypt(b"", b"aad").unwrap();
        assert!(c.decrypt(&ct, b"aad").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_key_length() {
        let result = DeterministicCipher::new(SecretVec::new(vec![0x42; 32]));
        assert!(matches!(result, Err(Error::InvalidKeyLength { expected: 64, actual: 32 })));
    }
}
