//! Word-searchable encryption for the `Search` onion.
//!
//! A text value is stored as the sorted, deduplicated set of keyed word tags
//! followed by a deterministic payload carrying the full text:
//!
//! ```text
//! [count: u16 BE][tag_1 .. tag_count: 8 bytes each][AES-SIV payload]
//! ```
//!
//! A tag is `HMAC-SHA256(key, lowercase word)[..8]`. The store matches
//! `LIKE '%word%'` by checking whether the token for `word` is among the tags,
//! which makes matching whole-word and case-insensitive.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;

use super::deterministic::DeterministicCipher;
use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

/// Truncated tag size.
pub const TOKEN_SIZE: usize = 8;

/// Key size for the tag PRF.
pub const SEARCH_TAG_KEY_SIZE: usize = 32;

/// Searchable cipher: tag key plus payload cipher.
pub struct SearchCipher {
    tag_key: SecretVec<u8>,
    payload: DeterministicCipher,
}

impl SearchCipher {
    /// Creates a cipher from a tag key and a 64-byte payload key.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyLength` if either key has the wrong size.
    pub fn new(tag_key: SecretVec<u8>, payload_key: SecretVec<u8>) -> Result<Self, Error> {
        if tag_key.expose_secret().len() != SEARCH_TAG_KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: SEARCH_TAG_KEY_SIZE,
                actual: tag_key.expose_secret().len(),
            });
        }
        Ok(Self { tag_key, payload: DeterministicCipher::new(payload_key)? })
    }

    /// Token a query uses to look for `word`.
    ///
    /// # Errors
    ///
    /// Returns `Error::EncryptionFailed` if the tag PRF cannot be keyed.
    pub fn token(&self, word: &str) -> Result<Vec<u8>, Error> {
        let mut mac = HmacSha256::new_from_slice(self.tag_key.expose_secret())
            .map_err(|e| Error::EncryptionFailed(format!("invalid SEARCH key: {e}")))?;
        mac.update(word.to_lowercase().as_bytes());
        Ok(mac.finalize().into_bytes()[..TOKEN_SIZE].to_vec())
    }

    /// Encrypts `text`.
    ///
    /// # Errors
    ///
    /// Returns `Error::EncryptionFailed` if the text has more distinct words
    /// than the count field holds, or the payload cipher fails.
    pub fn encrypt(&self, text: &str, aad: &[u8]) -> Result<Vec<u8>, Error> {
        let mut tags = words(text).map(|w| self.token(w)).collect::<Result<Vec<_>, _>>()?;
        tags.sort_unstable();
        tags.dedup();

        let count = u16::try_from(tags.len())
            .map_err(|_| Error::EncryptionFailed(format!("{} distinct words", tags.len())))?;

        let mut out = Vec::with_capacity(2 + tags.len() * TOKEN_SIZE + text.len() + 16);
        out.extend_from_slice(&count.to_be_bytes());
        for tag in &tags {
            out.extend_from_slice(tag);
        }
        out.extend_from_slice(&self.payload.encrypt(text.as_bytes(), aad)?);
        Ok(out)
    }

    /// Decrypts a value produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if the layout is truncated, the
    /// payload fails authentication, or the text is not UTF-8.
    pub fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<String, Error> {
        let offset = payload_offset(ciphertext)?;
        let plaintext = self.payload.decrypt(&ciphertext[offset..], aad)?;
        String::from_utf8(plaintext)
            .map_err(|e| Error::DecryptionFailed(format!("search payload is not UTF-8: {e}")))
    }
}

/// Checks whether `ciphertext` carries `token`.
///
/// Malformed ciphertexts never match.
#[must_use]
pub fn contains_token(ciphertext: &[u8], token: &[u8]) -> bool {
    let Ok(offset) = payload_offset(ciphertext) else {
        return false;
    };
    ciphertext[2..offset].chunks_exact(TOKEN_SIZE).any(|tag| tag == token)
}

/// Extracts the single search word from a `%word%` pattern.
#[must_use]
pub fn pattern_word(pattern: &str) -> Option<&str> {
    let word = pattern.strip_prefix('%')?.strip_suffix('%')?;
    let is_word = !word.is_empty() && word.chars().all(|c| c.is_alphanumeric() || c == '_');
    is_word.then_some(word)
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_')).filter(|w| !w.is_empty())
}

fn payload_offset(ciphertext: &[u8]) -> Result<usize, Error> {
    if ciphertext.len() < 2 {
        return Err(Error::DecryptionFailed("search ciphertext truncated".to_string()));
    }
    let count = usize::from(u16::from_be_bytes([ciphertext[0], ciphertext[1]]));
    let offset = 2 + count * TOKEN_SIZE;
    if offset > ciphertext.len() {
        return Err(Error::DecryptionFailed("search tags truncated".to_string()));
    }
    Ok(offset)
}
