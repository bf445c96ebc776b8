//! Order-preserving encoding for the `Ord` onion.
//!
//! The encoding maps an `in_bits` domain into an `out_bits` range by
//! recursive splitting: at every step the current domain interval is halved
//! and the current range interval is cut at a point chosen by an HMAC-SHA256
//! PRF over the interval bounds. Both halves keep at least as many range
//! points as domain points, so the mapping is strictly increasing and can be
//! inverted by replaying the same descent on the ciphertext.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

/// Key size for the split PRF.
pub const OPE_KEY_SIZE: usize = 32;

/// Width of an encoded value in bytes.
pub const OPE_BLOCK_SIZE: usize = 16;

const SPLIT: u8 = 0x01;
const LEAF: u8 = 0x02;

/// Keyed order-preserving encoder from `in_bits` to `out_bits`.
pub struct OrderPreserving {
    key: SecretVec<u8>,
    in_bits: u32,
    out_bits: u32,
}

impl OrderPreserving {
    /// Creates an encoder.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyLength` for a key that is not 32 bytes, and
    /// `Error::InvalidKeyMaterial` unless `in_bits < out_bits <= 127`.
    pub fn new(key: SecretVec<u8>, in_bits: u32, out_bits: u32) -> Result<Self, Error> {
        if key.expose_secret().len() != OPE_KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: OPE_KEY_SIZE,
                actual: key.expose_secret().len(),
            });
        }
        if in_bits == 0 || in_bits >= out_bits || out_bits > 127 {
            return Err(Error::InvalidKeyMaterial(format!(
                "order-preserving widths {in_bits} -> {out_bits} out of bounds"
            )));
        }
        Ok(Self { key, in_bits, out_bits })
    }

    /// Encodes `plaintext`, which must fit in `in_bits`.
    ///
    /// # Errors
    ///
    /// Returns `Error::EncryptionFailed` if the plaintext is out of the domain.
    pub fn encrypt(&self, plaintext: u128) -> Result<u128, Error> {
        if plaintext >> self.in_bits != 0 {
            return Err(Error::EncryptionFailed(format!(
                "value does not fit in {} bits",
                self.in_bits
            )));
        }

        let mut cursor = Cursor::new(self.in_bits, self.out_bits);
        while cursor.d_size > 1 {
            let left = self.split(&cursor)?;
            let go_left = plaintext < cursor.d_lo + cursor.d_size / 2;
            cursor.descend(left, go_left);
        }

        Ok(cursor.r_lo + self.leaf_offset(&cursor)?)
    }

    /// Decodes a value produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if `ciphertext` is not an encoding
    /// under this key.
    pub fn decrypt(&self, ciphertext: u128) -> Result<u128, Error> {
        if ciphertext >> self.out_bits != 0 {
            return Err(Error::DecryptionFailed("order-preserving value out of range".to_string()));
        }

        let mut cursor = Cursor::new(self.in_bits, self.out_bits);
        while cursor.d_size > 1 {
            let left = self.split(&cursor)?;
            let go_left = ciphertext < cursor.r_lo + left;
            cursor.descend(left, go_left);
        }

        if cursor.r_lo + self.leaf_offset(&cursor)? != ciphertext {
            return Err(Error::DecryptionFailed(
                "not an order-preserving encoding under this key".to_string(),
            ));
        }
        Ok(cursor.d_lo)
    }

    /// Number of range points given to the lower half of the current domain.
    fn split(&self, cursor: &Cursor) -> Result<u128, Error> {
        let half = cursor.d_size / 2;
        let slack = cursor.r_size - cursor.d_size;
        Ok(half + self.prf(SPLIT, cursor)? % (slack + 1))
    }

    fn leaf_offset(&self, cursor: &Cursor) -> Result<u128, Error> {
        Ok(self.prf(LEAF, cursor)? % cursor.r_size)
    }

    fn prf(&self, tag: u8, cursor: &Cursor) -> Result<u128, Error> {
        let mut mac = HmacSha256::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::EncryptionFailed(format!("invalid OPE key: {e}")))?;
        mac.update(&[tag]);
        mac.update(&cursor.d_lo.to_be_bytes());
        mac.update(&cursor.d_size.to_be_bytes());
        mac.update(&cursor.r_lo.to_be_bytes());
        mac.update(&cursor.r_size.to_be_bytes());

        let digest = mac.finalize().into_bytes();
        let mut block = [0u8; 16];
        block.copy_from_slice(&digest[..16]);
        Ok(u128::from_be_bytes(block))
    }
}

/// Current domain and range intervals of a descent.
struct Cursor {
    d_lo: u128,
    d_size: u128,
    r_lo: u128,
    r_size: u128,
}

impl Cursor {
    const fn new(in_bits: u32, out_bits: u32) -> Self {
        Self { d_lo: 0, d_size: 1 << in_bits, r_lo: 0, r_size: 1 << out_bits }
    }

    fn descend(&mut self, left: u128, go_left: bool) {
        let half = self.d_size / 2;
        if go_left {
            self.d_size = half;
            self.r_size = left;
        } else {
            self.d_lo += half;
            self.d_size -= half;
            self.r_lo += left;
            self.r_size -= left;
        }
    }
}

/// Maps a signed integer onto `u64` preserving order.
#[must_use]
pub const fn order_key_i64(value: i64) -> u64 {
    u64::from_be_bytes(value.to_be_bytes()) ^ (1 << 63)
}

/// Inverse of [`order_key_i64`].
#[must_use]
pub const fn i64_from_order_key(key: u64) -> i64 {
    i64::from_be_bytes((key ^ (1 << 63)).to_be_bytes())
}

/// Order key of a byte string: its first eight bytes, zero padded.
///
/// Strings sharing an eight-byte prefix get the same key.
#[must_use]
pub fn order_key_bytes(bytes: &[u8]) -> u64 {
    let mut prefix = [0u8; 8];
    let n = bytes.len().min(8);
    prefix[..n].copy_from_slice(&bytes[..n]);
    u64::from_be_bytes(prefix)
}
