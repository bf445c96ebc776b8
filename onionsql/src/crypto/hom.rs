//! Additively homomorphic encryption (Paillier) for the `Hom` onion.
//!
//! The modulus is the product of two 31-bit primes, so `n^2` fits in 124 bits
//! and all arithmetic stays in `u128`. The primes are drawn from a `StdRng`
//! seeded with derived key bytes, and the per-row randomizer is derived from
//! the row salt. Multiplying two ciphertexts modulo `n^2` adds their
//! plaintexts modulo `n`.
//!
//! A 64-bit value does not fit below `n / 2`, so every integer is split into
//! a signed high limb and an unsigned low limb of 32 bits each, encrypted
//! separately. Limbwise sums stay exact for up to 2^26 addends of any `i64`;
//! the recombined total is checked against the `i64` range on decryption.
//!
//! The modulus is small. This layer demonstrates server-side `SUM` and `+`
//! over ciphertext; it is not a production-strength Paillier instance.

use hmac::{Hmac, Mac};
use rand::{rngs::StdRng, Rng, SeedableRng};
use sha2::Sha256;

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

/// Size of the serialized private key: two big-endian `u64` primes.
pub const HOM_KEY_SIZE: usize = 16;

/// Size of an encoded modulus or limb ciphertext.
pub const HOM_BLOCK_SIZE: usize = 16;

/// Size of an encoded ciphertext: the high limb, then the low limb.
pub const HOM_CIPHERTEXT_SIZE: usize = 2 * HOM_BLOCK_SIZE;

const PRIME_BITS: u32 = 31;

const LIMB_BITS: u32 = 32;

/// Encryption of one integer as a pair of limb ciphertexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomCiphertext {
    high: u128,
    low: u128,
}

impl HomCiphertext {
    /// Ciphertext of the sum of both plaintexts, under modulus `n`.
    #[must_use]
    pub fn add(&self, other: &Self, n: u128) -> Self {
        Self { high: add_ciphertexts(self.high, other.high, n), low: add_ciphertexts(self.low, other.low, n) }
    }

    /// Fixed-width encoding.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = to_block(self.high);
        bytes.extend(to_block(self.low));
        bytes
    }

    /// Parses the fixed-width encoding.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if the blob has the wrong size.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != HOM_CIPHERTEXT_SIZE {
            return Err(Error::DecryptionFailed(format!("HOM ciphertext of {} bytes", bytes.len())));
        }
        let (high, low) = bytes.split_at(HOM_BLOCK_SIZE);
        Ok(Self { high: from_block(high)?, low: from_block(low)? })
    }
}

/// Paillier key pair over `u128` arithmetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paillier {
    p: u64,
    q: u64,
    n: u128,
    n_squared: u128,
    lambda: u128,
    mu: u128,
}

impl Paillier {
    /// Generates a key pair deterministically from a 32-byte seed.
    #[must_use]
    pub fn generate(seed: [u8; 32]) -> Self {
        let mut rng = StdRng::from_seed(seed);
        loop {
            let p = random_prime(&mut rng);
            let q = random_prime(&mut rng);
            if let Ok(key) = Self::from_primes(p, q) {
                return key;
            }
        }
    }

    /// Rebuilds a key pair from its primes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyMaterial` if the primes are not two distinct
    /// 31-bit primes, which keeps every limb below `n / 2`.
    pub fn from_primes(p: u64, q: u64) -> Result<Self, Error> {
        let sized = |x: u64| x >> PRIME_BITS == 0 && x >> (PRIME_BITS - 1) == 1;
        if p == q || !sized(p) || !sized(q) || !is_prime(p) || !is_prime(q) {
            return Err(Error::InvalidKeyMaterial("invalid Paillier primes".to_string()));
        }
        let n = u128::from(p) * u128::from(q);
        let n_squared = n * n;
        let lambda = lcm(u128::from(p - 1), u128::from(q - 1));
        let mu = mod_inverse(lambda % n, n)
            .ok_or_else(|| Error::InvalidKeyMaterial("Paillier lambda not invertible".to_string()))?;
        Ok(Self { p, q, n, n_squared, lambda, mu })
    }

    /// Parses a serialized private key.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyLength` or `Error::InvalidKeyMaterial`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != HOM_KEY_SIZE {
            return Err(Error::InvalidKeyLength { expected: HOM_KEY_SIZE, actual: bytes.len() });
        }
        let mut p = [0u8; 8];
        let mut q = [0u8; 8];
        p.copy_from_slice(&bytes[..8]);
        q.copy_from_slice(&bytes[8..]);
        Self::from_primes(u64::from_be_bytes(p), u64::from_be_bytes(q))
    }

    /// Serializes the private key.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HOM_KEY_SIZE);
        bytes.extend_from_slice(&self.p.to_be_bytes());
        bytes.extend_from_slice(&self.q.to_be_bytes());
        bytes
    }

    /// Public modulus `n`.
    #[must_use]
    pub const fn modulus(&self) -> u128 {
        self.n
    }

    /// Encrypts a signed integer with randomizers derived from `salt`.
    ///
    /// # Errors
    ///
    /// Returns `Error::EncryptionFailed` if a randomizer cannot be derived.
    pub fn encrypt(&self, value: i64, salt: u64) -> Result<HomCiphertext, Error> {
        let high = value >> LIMB_BITS;
        let low = value & ((1 << LIMB_BITS) - 1);
        Ok(HomCiphertext { high: self.encrypt_limb(high, salt, 0)?, low: self.encrypt_limb(low, salt, 1)? })
    }

    /// Decrypts a ciphertext, or a sum of ciphertexts, into a signed integer.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if a limb is not below `n^2` or the
    /// total does not fit an `i64`.
    pub fn decrypt(&self, ciphertext: &HomCiphertext) -> Result<i64, Error> {
        let high = i128::from(self.decrypt_limb(ciphertext.high)?);
        let low = i128::from(self.decrypt_limb(ciphertext.low)?);
        i64::try_from((high << LIMB_BITS) + low)
            .map_err(|_| Error::DecryptionFailed("homomorphic total overflows i64".to_string()))
    }

    fn encrypt_limb(&self, limb: i64, salt: u64, index: u8) -> Result<u128, Error> {
        let m = self.encode(limb);
        let r = self.randomizer(salt, index)?;
        let g_m = (1 + mul_mod(m, self.n, self.n_squared)) % self.n_squared;
        Ok(mul_mod(g_m, pow_mod(r, self.n, self.n_squared), self.n_squared))
    }

    fn decrypt_limb(&self, ciphertext: u128) -> Result<i64, Error> {
        if ciphertext == 0 || ciphertext >= self.n_squared {
            return Err(Error::DecryptionFailed("Paillier ciphertext out of range".to_string()));
        }
        let u = pow_mod(ciphertext, self.lambda, self.n_squared);
        let l = (u - 1) / self.n;
        let m = mul_mod(l, self.mu, self.n);
        self.decode(m)
    }

    /// Limbs are below 2^32 in magnitude, far inside `n / 2`.
    fn encode(&self, limb: i64) -> u128 {
        let magnitude = u128::from(limb.unsigned_abs());
        if limb < 0 {
            self.n - magnitude
        } else {
            magnitude
        }
    }

    fn decode(&self, m: u128) -> Result<i64, Error> {
        let (negative, magnitude) = if m > self.n / 2 { (true, self.n - m) } else { (false, m) };
        let magnitude = i64::try_from(magnitude)
            .map_err(|_| Error::DecryptionFailed("Paillier plaintext overflows i64".to_string()))?;
        Ok(if negative { -magnitude } else { magnitude })
    }

    fn randomizer(&self, salt: u64, index: u8) -> Result<u128, Error> {
        let mut mac = HmacSha256::new_from_slice(&self.to_bytes())
            .map_err(|e| Error::EncryptionFailed(format!("invalid HOM key: {e}")))?;
        mac.update(&salt.to_be_bytes());
        mac.update(&[index]);
        let digest = mac.finalize().into_bytes();
        let mut block = [0u8; 16];
        block.copy_from_slice(&digest[..16]);

        let mut r = u128::from_be_bytes(block) % (self.n - 1) + 1;
        while gcd(r, self.n) != 1 {
            r = r % (self.n - 1) + 1;
        }
        Ok(r)
    }
}

/// Adds the plaintexts under two limb ciphertexts sharing modulus `n`.
fn add_ciphertexts(a: u128, b: u128, n: u128) -> u128 {
    let n_squared = n * n;
    mul_mod(a % n_squared, b % n_squared, n_squared)
}

/// Encodes a modulus or limb ciphertext as a fixed-width blob.
#[must_use]
pub fn to_block(value: u128) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Parses a fixed-width blob.
///
/// # Errors
///
/// Returns `Error::DecryptionFailed` if the blob is not 16 bytes.
pub fn from_block(bytes: &[u8]) -> Result<u128, Error> {
    let block: [u8; HOM_BLOCK_SIZE] = bytes
        .try_into()
        .map_err(|_| Error::DecryptionFailed(format!("HOM block of {} bytes", bytes.len())))?;
    Ok(u128::from_be_bytes(block))
}

fn random_prime(rng: &mut StdRng) -> u64 {
    loop {
        let candidate: u64 = rng.gen_range((1 << (PRIME_BITS - 1))..(1 << PRIME_BITS)) | 1;
        if is_prime(candidate) {
            return candidate;
        }
    }
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    for small in [2u64, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        if n % small == 0 {
            return n == small;
        }
    }
    let n128 = u128::from(n);
    let mut d = n128 - 1;
    let mut s = 0;
    while d % 2 == 0 {
        d /= 2;
        s += 1;
    }
    'witness: for a in [2u128, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        let mut x = pow_mod(a, d, n128);
        if x == 1 || x == n128 - 1 {
            continue;
        }
        for _ in 1..s {
            x = mul_mod(x, x, n128);
            if x == n128 - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// `a * b mod m` without overflow for `m < 2^126`.
fn mul_mod(a: u128, b: u128, m: u128) -> u128 {
    let mut a = a % m;
    let mut b = b % m;
    let mut result = 0u128;
    while b > 0 {
        if b & 1 == 1 {
            result = (result + a) % m;
        }
        a = (a << 1) % m;
        b >>= 1;
    }
    result
}

fn pow_mod(base: u128, exp: u128, m: u128) -> u128 {
    let mut base = base % m;
    let mut exp = exp;
    let mut result = 1 % m;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    result
}

const fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

const fn lcm(a: u128, b: u128) -> u128 {
    a / gcd(a, b) * b
}

fn mod_inverse(a: u128, m: u128) -> Option<u128> {
    let m_signed = i128::try_from(m).ok()?;
    let (mut old_r, mut r) = (i128::try_from(a).ok()?, m_signed);
    let (mut old_s, mut s) = (1i128, 0i128);
    while r != 0 {
        let quotient = old_r / r;
        (old_r, r) = (r, old_r - quotient * r);
        (old_s, s) = (s, old_s - quotient * s);
    }
    if old_r != 1 {
        return None;
    }
    u128::try_from(old_s.rem_euclid(m_signed)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Paillier {
        Paillier::generate([5u8; 32])
    }

    #[test]
    fn test_generation_is_deterministic() {
        assert_eq!(Paillier::generate([1u8; 32]), Paillier::generate([1u8; 32]));
        assert_ne!(Paillier::generate([1u8; 32]), Paillier::generate([2u8; 32]));
    }

    #[test]
    fn test_roundtrip_signed() {
        let k = key();
        for v in [0i64, 1, -1, 42, -1_000_000, 1 << 40, 1 << 62, i64::MAX, i64::MIN, i64::MIN + 1] {
            let c = k.encrypt(v, 99).unwrap();
            assert_eq!(k.decrypt(&c).unwrap(), v);
        }
    }

    #[test]
    fn test_salt_randomizes() {
        let k = key();
        assert_ne!(k.encrypt(7, 1).unwrap(), k.encrypt(7, 2).unwrap());
    }

    #[test]
    fn test_homomorphic_addition() {
        let k = key();
        let a = k.encrypt(20, 1).unwrap();
        let b = k.encrypt(-5, 2).unwrap();
        let c = k.encrypt(7, 3).unwrap();
        let sum = a.add(&b, k.modulus()).add(&c, k.modulus());
        assert_eq!(k.decrypt(&sum).unwrap(), 22);
    }

    #[test]
    fn test_addition_of_large_values() {
        let k = key();
        let n = k.modulus();
        let big = 1i64 << 62;
        let a = k.encrypt(big, 1).unwrap();
        let b = k.encrypt(-(big - 3), 2).unwrap();
        assert_eq!(k.decrypt(&a.add(&b, n)).unwrap(), 3);

        let c = k.encrypt(i64::MIN, 3).unwrap();
        let d = k.encrypt(i64::MAX, 4).unwrap();
        assert_eq!(k.decrypt(&c.add(&d, n)).unwrap(), -1);

        let many = (0..1000).fold(k.encrypt(0, 0).unwrap(), |acc, i| acc.add(&k.encrypt(1 << 52, i).unwrap(), n));
        assert_eq!(k.decrypt(&many).unwrap(), 1000 << 52);
    }

    #[test]
    fn test_overflowing_total_is_rejected() {
        let k = key();
        let a = k.encrypt(i64::MAX, 1).unwrap();
        let b = k.encrypt(1, 2).unwrap();
        assert!(matches!(k.decrypt(&a.add(&b, k.modulus())), Err(Error::DecryptionFailed(_))));
    }

    #[test]
    fn test_key_bytes_roundtrip() {
        let k = key();
        assert_eq!(Paillier::from_bytes(&k.to_bytes()).unwrap(), k);
        assert!(Paillier::from_bytes(&[0u8; 16]).is_err());
        assert!(Paillier::from_primes(17, 19).is_err());
    }

    #[test]
    fn test_primality() {
        assert!(is_prime(2_147_483_647));
        assert!(!is_prime(2_147_483_649));
        assert!(!is_prime(1));
    }

    #[test]
    fn test_block_roundtrip() {
        assert_eq!(from_block(&to_block(12345)).unwrap(), 12345);
        assert!(from_block(&[1, 2, 3]).is_err());

        let c = key().encrypt(-9, 5).unwrap();
        assert_eq!(HomCiphertext::from_bytes(&c.to_bytes()).unwrap(), c);
        assert!(HomCiphertext::from_bytes(&to_block(1)).is_err());
    }
}
