//! Layer key derivation using HKDF (HMAC-based Key Derivation Function).
//!
//! Every layer key is derived from the master key with the layer's
//! [`LayerContext`] as the `info` parameter. Derivation only happens when a
//! column or onion is created; on restart layers are rebuilt from the key
//! material persisted in the metadata mirror.

use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;

use super::context::LayerContext;
use crate::error::Error;

/// Master key size in bytes (256 bits).
pub const MASTER_KEY_SIZE: usize = 32;

/// Derives `len` bytes of layer key from the master key.
///
/// # Errors
///
/// Returns `Error::KeyDerivation` if `len` exceeds what HKDF-SHA256 can expand.
///
/// # Example
///
/// ```
/// use onionsql::crypto::context::LayerContext;
/// use onionsql::crypto::kdf::derive_layer_key;
/// use onionsql::crypto::{Onion, SecLevel};
/// use secrecy::SecretVec;
///
/// let master = SecretVec::new(vec![0u8; 32]);
/// let ctx = LayerContext::new("table_x", "field_y", Onion::Det, SecLevel::Det);
/// let key = derive_layer_key(&master, &ctx, 64).expect("derivation failed");
/// ```
pub fn derive_layer_key(
    master: &SecretVec<u8>,
    context: &LayerContext,
    len: usize,
) -> Result<SecretVec<u8>, Error> {
    let hkdf = Hkdf::<Sha256>::new(None, master.expose_secret());

    let info = context.to_string();
    let mut key = vec![0u8; len];
    hkdf.expand(info.as_bytes(), &mut key).map_err(|_| Error::KeyDerivation)?;

    Ok(SecretVec::new(key))
}

/// Generates a random master key.
#[must_use]
pub fn generate_master_key() -> SecretVec<u8> {
    let mut key = vec![0u8; MASTER_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    SecretVec::new(key)
}

/// Draws a fresh per-row salt.
///
/// Salts are kept below 2^63 so they survive a round trip through a signed
/// SQL integer column.
#[must_use]
pub fn generate_salt() -> u64 {
    rand::thread_rng().next_u64() >> 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Onion, SecLevel};

    #[test]
    fn test_derive_layer_key_deterministic() {
        let master = SecretVec::new(vec![1u8; 32]);
        let ctx = LayerContext::new("t", "f", Onion::Det, SecLevel::Det);

        let k1 = derive_layer_key(&master, &ctx, 64).unwrap();
        let k2 = derive_layer_key(&master, &ctx, 64).unwrap();

        assert_eq!(k1.expose_secret(), k2.expose_secret());
        assert_eq!(k1.expose_secret().len(), 64);
    }

    #[test]
    fn test_derive_layer_key_different_levels() {
        let master = SecretVec::new(vec![1u8; 32]);
        let det = LayerContext::new("t", "f", Onion::Det, SecLevel::Det);
        let rnd = LayerContext::new("t", "f", Onion::Det, SecLevel::Rnd);

        let k1 = derive_layer_key(&master, &det, 32).unwrap();
        let k2 = derive_layer_key(&master, &rnd, 32).unwrap();

        assert_ne!(k1.expose_secret(), k2.expose_secret());
    }

    #[test]
    fn test_derive_layer_key_different_masters() {
        let ctx = LayerContext::shared(Onion::Ord, SecLevel::OpeJoin);
        let k1 = derive_layer_key(&SecretVec::new(vec![1u8; 32]), &ctx, 32).unwrap();
        let k2 = derive_layer_key(&SecretVec::new(vec![2u8; 32]), &ctx, 32).unwrap();

        assert_ne!(k1.expose_secret(), k2.expose_secret());
    }

    #[test]
    fn test_derive_layer_key_too_long() {
        let master = SecretVec::new(vec![1u8; 32]);
        let ctx = LayerContext::shared(Onion::Det, SecLevel::DetJoin);

        assert!(matches!(derive_layer_key(&master, &ctx, 255 * 32 + 1), Err(Error::KeyDerivation)));
    }

    #[test]
    fn test_generate_master_key() {
        let k1 = generate_master_key();
        let k2 = generate_master_key();

        assert_ne!(k1.expose_secret(), k2.expose_secret());
        assert_eq!(k1.expose_secret().len(), MASTER_KEY_SIZE);
    }

    #[test]
    fn test_salt_fits_signed_column() {
        for _ in 0..64 {
            assert!(i64::try_from(generate_salt()).is_ok());
        }
    }
}
