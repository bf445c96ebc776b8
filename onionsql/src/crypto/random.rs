//! Randomized encryption using ChaCha20-Poly1305 for the `Rnd` level.
//!
//! The nonce is derived from the per-row salt stored next to the column, so
//! equal plaintexts in different rows produce unrelated ciphertexts while the
//! store keeps everything needed to peel the layer.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use secrecy::{ExposeSecret, SecretVec};

use crate::error::Error;

/// Key size for ChaCha20-Poly1305.
pub const RND_KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
const NONCE_SIZE: usize = 12;

/// Randomized cipher keyed per onion, nonced per row.
pub struct RandomCipher {
    key: SecretVec<u8>,
}

impl RandomCipher {
    /// Creates a cipher over a 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyLength` if the key is not 32 bytes.
    pub fn new(key: SecretVec<u8>) -> Result<Self, Error> {
        if key.expose_secret().len() != RND_KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: RND_KEY_SIZE,
                actual: key.expose_secret().len(),
            });
        }
        Ok(Self { key })
    }

    /// Encrypts `plaintext` under the nonce derived from `salt`.
    ///
    /// # Errors
    ///
    /// Returns `Error::EncryptionFailed` if the cipher rejects the input.
    pub fn encrypt(&self, plaintext: &[u8], salt: u64, aad: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = ChaCha20Poly1305::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::EncryptionFailed(format!("invalid RND key: {e}")))?;

        cipher
            .encrypt(&nonce_for(salt), Payload { msg: plaintext, aad })
            .map_err(|e| Error::EncryptionFailed(format!("ChaCha20-Poly1305 encryption failed: {e}")))
    }

    /// Decrypts a ciphertext produced under the same `salt`.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if authentication fails, which is
    /// also what a wrong salt looks like.
    pub fn decrypt(&self, ciphertext: &[u8], salt: u64, aad: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = ChaCha20Poly1305::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::DecryptionFailed(format!("invalid RND key: {e}")))?;

        cipher
            .decrypt(&nonce_for(salt), Payload { msg: ciphertext, aad })
            .map_err(|e| Error::DecryptionFailed(format!("ChaCha20-Poly1305 decryption failed: {e}")))
    }
}

fn nonce_for(salt: u64) -> Nonce {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes[NONCE_SIZE - 8..].copy_from_slice(&salt.to_be_bytes());
    Nonce::from(nonce_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> RandomCipher {
        RandomCipher::new(SecretVec::new(vec![9u8; 32])).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let c = cipher();
        let ct = c.encrypt(b"secret", 77, b"aad").unwrap();
        assert_eq!(c.decrypt(&ct, 77, b"aad").unwrap(), b"secret");
    }

    #[test]
    fn test_salt_randomizes() {
        let c = cipher();
        let ct1 = c.encrypt(b"secret", 1, b"aad").unwrap();
        let ct2 = c.encrypt(b"secret", 2, b"aad").unwrap();
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_wrong_salt_fails() {
        let c = cipher();
        let ct = c.encrypt(b"secret", 1, b"aad").unwrap();
        assert!(c.decrypt(&ct, 2, b"aad").is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(RandomCipher::new(SecretVec::new(vec![0u8; 16])).is_err());
    }
}
