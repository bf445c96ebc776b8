//! One encryption layer of an onion.
//!
//! A [`Layer`] is bound to an onion, a level and the declared type of the
//! column it protects. Encrypting at a level takes the representation of the
//! level below (plaintext for the bottom of a chain) and produces a blob;
//! decrypting reverses exactly one step.
//!
//! | level      | input            | output                                   |
//! |------------|------------------|------------------------------------------|
//! | `DetJoin`  | plaintext        | AES-SIV under the shared key             |
//! | `Det`      | `DetJoin` blob   | AES-SIV under the field key              |
//! | `OpeJoin`  | plaintext        | OPE(64 -> 96) head, AES-SIV tail for text |
//! | `Ope`      | `OpeJoin` blob   | OPE(96 -> 124) head, re-encrypted tail    |
//! | `Rnd`      | any blob         | ChaCha20-Poly1305, nonce from row salt   |
//! | `Hom`      | integer          | two Paillier limb ciphertexts            |
//! | `Search`   | text             | word tags and AES-SIV payload            |
//!
//! Order over text is exact only on the first eight bytes: the OPE head
//! encodes that prefix, so strings sharing it compare by their AES-SIV tails,
//! which is an arbitrary but stable order. Range predicates and sorting over
//! longer text are approximate past the prefix.

use secrecy::{ExposeSecret, SecretVec};

use super::context::LayerContext;
use super::deterministic::{DeterministicCipher, SIV_KEY_SIZE};
use super::hom::{HomCiphertext, Paillier};
use super::kdf::derive_layer_key;
use super::material::KeyMaterial;
use super::ope::{self, OrderPreserving, OPE_BLOCK_SIZE, OPE_KEY_SIZE};
use super::random::{RandomCipher, RND_KEY_SIZE};
use super::search::{SearchCipher, SEARCH_TAG_KEY_SIZE};
use super::{Onion, SecLevel, SqlType};
use crate::error::Error;
use crate::value::Value;

const JOIN_BITS: (u32, u32) = (64, 96);
const FIELD_BITS: (u32, u32) = (96, 124);

/// One layer of an onion's stack.
pub struct Layer {
    onion: Onion,
    level: SecLevel,
    sql_type: SqlType,
    key: SecretVec<u8>,
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("onion", &self.onion)
            .field("level", &self.level)
            .field("sql_type", &self.sql_type)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl Layer {
    /// Derives a new layer from the master key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Unsupported` for `PlainVal` or a level that is not on
    /// the onion's chain, and `Error::KeyDerivation` if derivation fails.
    pub fn derive(
        onion: Onion,
        level: SecLevel,
        sql_type: SqlType,
        master: &SecretVec<u8>,
        context: &LayerContext,
    ) -> Result<Self, Error> {
        if !onion.contains(level) {
            return Err(Error::Unsupported(format!("no {level} layer on the {onion} onion")));
        }
        let key = match level {
            SecLevel::DetJoin | SecLevel::Det => derive_layer_key(master, context, SIV_KEY_SIZE)?,
            SecLevel::Rnd => derive_layer_key(master, context, RND_KEY_SIZE)?,
            SecLevel::OpeJoin | SecLevel::Ope => {
                derive_layer_key(master, context, OPE_KEY_SIZE + SIV_KEY_SIZE)?
            }
            SecLevel::Search => derive_layer_key(master, context, SEARCH_TAG_KEY_SIZE + SIV_KEY_SIZE)?,
            SecLevel::Hom => {
                let seed = derive_layer_key(master, context, 32)?;
                let mut block = [0u8; 32];
                block.copy_from_slice(seed.expose_secret());
                SecretVec::new(Paillier::generate(block).to_bytes())
            }
            SecLevel::PlainVal => {
                return Err(Error::Unsupported("plaintext has no layer".to_string()));
            }
        };
        Ok(Self { onion, level, sql_type, key })
    }

    /// Rebuilds a layer from serialized key material.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope is malformed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let material = KeyMaterial::from_bytes(bytes)?;
        Ok(Self {
            onion: material.onion(),
            level: material.level(),
            sql_type: material.sql_type(),
            key: SecretVec::new(material.key().expose_secret().clone()),
        })
    }

    /// Serializes the layer's key material.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyMaterial` if the key cannot be framed.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        KeyMaterial::new(self.onion, self.level, self.sql_type, self.clone_key()).to_bytes()
    }

    /// Returns the onion.
    #[must_use]
    pub const fn onion(&self) -> Onion {
        self.onion
    }

    /// Returns the level.
    #[must_use]
    pub const fn level(&self) -> SecLevel {
        self.level
    }

    /// Returns the declared type of the protected column.
    #[must_use]
    pub const fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    /// Applies this layer to the representation of the level below.
    ///
    /// `salt` is only consulted by `Rnd` and `Hom`.
    ///
    /// # Errors
    ///
    /// Returns `Error::EncryptionFailed` if the input has the wrong shape.
    pub fn encrypt(&self, value: &Value, salt: u64) -> Result<Value, Error> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let aad = self.aad();
        let out = match self.level {
            SecLevel::DetJoin | SecLevel::Det => {
                let input = match self.level {
                    SecLevel::DetJoin => plain_bytes(&coerce(value, self.sql_type)?),
                    _ => expect_blob(value, self.level)?.to_vec(),
                };
                self.siv(0)?.encrypt(&input, &aad)?
            }
            SecLevel::Rnd => self.rnd()?.encrypt(expect_blob(value, self.level)?, salt, &aad)?,
            SecLevel::OpeJoin => {
                let value = coerce(value, self.sql_type)?;
                // Text orders by its eight-byte prefix; ties fall to the SIV tail.
                let order_key = match &value {
                    Value::Integer(v) => ope::order_key_i64(*v),
                    other => ope::order_key_bytes(&plain_bytes(other)),
                };
                let mut out = self.ope(JOIN_BITS)?.encrypt(u128::from(order_key))?.to_be_bytes().to_vec();
                if self.sql_type != SqlType::Integer {
                    out.extend(self.siv(OPE_KEY_SIZE)?.encrypt(&plain_bytes(&value), &aad)?);
                }
                out
            }
            SecLevel::Ope => {
                let (head, tail) = split_ope(expect_blob(value, self.level)?)?;
                let mut out = self.ope(FIELD_BITS)?.encrypt(head)?.to_be_bytes().to_vec();
                if !tail.is_empty() {
                    out.extend(self.siv(OPE_KEY_SIZE)?.encrypt(tail, &aad)?);
                }
                out
            }
            SecLevel::Hom => {
                let v = coerce(value, SqlType::Integer)?.as_integer().ok_or_else(|| {
                    Error::EncryptionFailed("HOM layer expects an integer".to_string())
                })?;
                self.paillier()?.encrypt(v, salt)?.to_bytes()
            }
            SecLevel::Search => {
                let text = coerce(value, SqlType::Text)?;
                let text = text.as_text().ok_or_else(|| {
                    Error::EncryptionFailed("SEARCH layer expects text".to_string())
                })?;
                self.search()?.encrypt(text, &aad)?
            }
            SecLevel::PlainVal => return Ok(value.clone()),
        };
        Ok(Value::Blob(out))
    }

    /// Removes this layer, yielding the representation of the level below.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if the value is not a ciphertext of
    /// this layer, including a `Rnd` value decrypted under the wrong salt.
    pub fn decrypt(&self, value: &Value, salt: u64) -> Result<Value, Error> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let aad = self.aad();
        let input = value.as_blob().ok_or_else(|| {
            Error::DecryptionFailed(format!("{} layer expects a blob, got {}", self.level, value.kind()))
        })?;
        match self.level {
            SecLevel::DetJoin => from_plain_bytes(self.siv(0)?.decrypt(input, &aad)?, self.sql_type),
            SecLevel::Det => Ok(Value::Blob(self.siv(0)?.decrypt(input, &aad)?)),
            SecLevel::Rnd => Ok(Value::Blob(self.rnd()?.decrypt(input, salt, &aad)?)),
            SecLevel::OpeJoin => {
                let (head, tail) = split_ope(input)?;
                if self.sql_type == SqlType::Integer {
                    let order_key = u64::try_from(self.ope(JOIN_BITS)?.decrypt(head)?)
                        .map_err(|_| Error::DecryptionFailed("order key out of range".to_string()))?;
                    Ok(Value::Integer(ope::i64_from_order_key(order_key)))
                } else {
                    from_plain_bytes(self.siv(OPE_KEY_SIZE)?.decrypt(tail, &aad)?, self.sql_type)
                }
            }
            SecLevel::Ope => {
                let (head, tail) = split_ope(input)?;
                let mut out = self.ope(FIELD_BITS)?.decrypt(head)?.to_be_bytes().to_vec();
                if !tail.is_empty() {
                    out.extend(self.siv(OPE_KEY_SIZE)?.decrypt(tail, &aad)?);
                }
                Ok(Value::Blob(out))
            }
            SecLevel::Hom => Ok(Value::Integer(self.paillier()?.decrypt(&HomCiphertext::from_bytes(input)?)?)),
            SecLevel::Search => Ok(Value::Text(self.search()?.decrypt(input, &aad)?)),
            SecLevel::PlainVal => Ok(value.clone()),
        }
    }

    /// Public Paillier modulus of a `Hom` layer.
    ///
    /// # Errors
    ///
    /// Returns `Error::Unsupported` for any other level.
    pub fn hom_modulus(&self) -> Result<u128, Error> {
        Ok(self.paillier()?.modulus())
    }

    /// Query token for `word` under a `Search` layer.
    ///
    /// # Errors
    ///
    /// Returns `Error::Unsupported` for any other level.
    pub fn search_token(&self, word: &str) -> Result<Vec<u8>, Error> {
        self.search()?.token(word)
    }

    fn aad(&self) -> Vec<u8> {
        format!("{}|{}", self.onion, self.level).into_bytes()
    }

    fn clone_key(&self) -> SecretVec<u8> {
        SecretVec::new(self.key.expose_secret().clone())
    }

    fn key_slice(&self, start: usize, len: usize) -> Result<SecretVec<u8>, Error> {
        let key = self.key.expose_secret();
        key.get(start..start + len).map(|k| SecretVec::new(k.to_vec())).ok_or(Error::InvalidKeyLength {
            expected: start + len,
            actual: key.len(),
        })
    }

    fn siv(&self, offset: usize) -> Result<DeterministicCipher, Error> {
        DeterministicCipher::new(self.key_slice(offset, SIV_KEY_SIZE)?)
    }

    fn rnd(&self) -> Result<RandomCipher, Error> {
        RandomCipher::new(self.clone_key())
    }

    fn ope(&self, (in_bits, out_bits): (u32, u32)) -> Result<OrderPreserving, Error> {
        OrderPreserving::new(self.key_slice(0, OPE_KEY_SIZE)?, in_bits, out_bits)
    }

    fn paillier(&self) -> Result<Paillier, Error> {
        if self.level != SecLevel::Hom {
            return Err(Error::Unsupported(format!("{} layer is not homomorphic", self.level)));
        }
        Paillier::from_bytes(self.key.expose_secret())
    }

    fn search(&self) -> Result<SearchCipher, Error> {
        if self.level != SecLevel::Search {
            return Err(Error::Unsupported(format!("{} layer is not searchable", self.level)));
        }
        SearchCipher::new(
            self.key_slice(0, SEARCH_TAG_KEY_SIZE)?,
            self.key_slice(SEARCH_TAG_KEY_SIZE, SIV_KEY_SIZE)?,
        )
    }
}

impl Clone for Layer {
    fn clone(&self) -> Self {
        Self { onion: self.onion, level: self.level, sql_type: self.sql_type, key: self.clone_key() }
    }
}

/// Converts a value to the declared column type where that is lossless.
fn coerce(value: &Value, sql_type: SqlType) -> Result<Value, Error> {
    match (value, sql_type) {
        (Value::Integer(_), SqlType::Integer)
        | (Value::Text(_), SqlType::Text)
        | (Value::Blob(_), SqlType::Blob) => Ok(value.clone()),
        (Value::Text(s), SqlType::Integer) => s
            .trim()
            .parse()
            .map(Value::Integer)
            .map_err(|_| Error::EncryptionFailed(format!("`{s}` is not an integer"))),
        (Value::Integer(v), SqlType::Text) => Ok(Value::Text(v.to_string())),
        (Value::Text(s), SqlType::Blob) => Ok(Value::Blob(s.as_bytes().to_vec())),
        (other, _) => Err(Error::EncryptionFailed(format!(
            "cannot encrypt {} as {sql_type}",
            other.kind()
        ))),
    }
}

fn plain_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Null => Vec::new(),
        Value::Integer(v) => v.to_be_bytes().to_vec(),
        Value::Text(s) => s.as_bytes().to_vec(),
        Value::Blob(b) => b.clone(),
    }
}

fn from_plain_bytes(bytes: Vec<u8>, sql_type: SqlType) -> Result<Value, Error> {
    match sql_type {
        SqlType::Integer => {
            let block: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::DecryptionFailed("integer plaintext is not 8 bytes".to_string()))?;
            Ok(Value::Integer(i64::from_be_bytes(block)))
        }
        SqlType::Text => String::from_utf8(bytes)
            .map(Value::Text)
            .map_err(|e| Error::DecryptionFailed(format!("text plaintext is not UTF-8: {e}"))),
        SqlType::Blob => Ok(Value::Blob(bytes)),
    }
}

fn expect_blob(value: &Value, level: SecLevel) -> Result<&[u8], Error> {
    value.as_blob().ok_or_else(|| {
        Error::EncryptionFailed(format!("{level} layer expects a blob, got {}", value.kind()))
    })
}

fn split_ope(bytes: &[u8]) -> Result<(u128, &[u8]), Error> {
    if bytes.len() < OPE_BLOCK_SIZE {
        return Err(Error::DecryptionFailed("order-preserving block truncated".to_string()));
    }
    let (head, tail) = bytes.split_at(OPE_BLOCK_SIZE);
    let mut block = [0u8; OPE_BLOCK_SIZE];
    block.copy_from_slice(head);
    Ok((u128::from_be_bytes(block), tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master() -> SecretVec<u8> {
        SecretVec::new(vec![0x11; 32])
    }

    fn layer(onion: Onion, level: SecLevel, sql_type: SqlType) -> Layer {
        let ctx = LayerContext::new("table_t", "field_f", onion, level);
        Layer::derive(onion, level, sql_type, &master(), &ctx).unwrap()
    }

    fn stack(onion: Onion, sql_type: SqlType) -> Vec<Layer> {
        onion.chain().iter().map(|level| layer(onion, *level, sql_type)).collect()
    }

    fn roundtrip(layers: &[Layer], plaintext: &Value, salt: u64) -> Value {
        let mut v = plaintext.clone();
        for l in layers {
            v = l.encrypt(&v, salt).unwrap();
        }
        for l in layers.iter().rev() {
            v = l.decrypt(&v, salt).unwrap();
        }
        v
    }

    #[test]
    fn test_det_stack_roundtrip() {
        for (sql_type, value) in [
            (SqlType::Integer, Value::from(-77)),
            (SqlType::Text, Value::from("alice")),
            (SqlType::Blob, Value::from(vec![1, 2, 3])),
        ] {
            let layers = stack(Onion::Det, sql_type);
            assert_eq!(roundtrip(&layers, &value, 5), value);
        }
    }

    #[test]
    fn test_ord_stack_roundtrip() {
        let layers = stack(Onion::Ord, SqlType::Integer);
        assert_eq!(roundtrip(&layers, &Value::from(i64::MIN), 3), Value::from(i64::MIN));

        let layers = stack(Onion::Ord, SqlType::Text);
        assert_eq!(roundtrip(&layers, &Value::from("zebra crossing"), 3), Value::from("zebra crossing"));
    }

    #[test]
    fn test_ope_level_preserves_order() {
        let join = layer(Onion::Ord, SecLevel::OpeJoin, SqlType::Integer);
        let ope = layer(Onion::Ord, SecLevel::Ope, SqlType::Integer);
        let enc = |v: i64| ope.encrypt(&join.encrypt(&Value::from(v), 0).unwrap(), 0).unwrap();

        let (a, b, c) = (enc(-10), enc(3), enc(400));
        assert!(a.as_blob().unwrap() < b.as_blob().unwrap());
        assert!(b.as_blob().unwrap() < c.as_blob().unwrap());
    }

    #[test]
    fn test_det_join_is_field_independent() {
        let ctx_a = LayerContext::new("t1", "a", Onion::Det, SecLevel::DetJoin);
        let ctx_b = LayerContext::new("t2", "b", Onion::Det, SecLevel::DetJoin);
        let a = Layer::derive(Onion::Det, SecLevel::DetJoin, SqlType::Integer, &master(), &ctx_a).unwrap();
        let b = Layer::derive(Onion::Det, SecLevel::DetJoin, SqlType::Integer, &master(), &ctx_b).unwrap();

        assert_eq!(a.encrypt(&Value::from(9), 0).unwrap(), b.encrypt(&Value::from(9), 0).unwrap());
    }

    #[test]
    fn test_literal_coercion() {
        let l = layer(Onion::Det, SecLevel::DetJoin, SqlType::Integer);
        assert_eq!(l.encrypt(&Value::from("42"), 0).unwrap(), l.encrypt(&Value::from(42), 0).unwrap());
        assert!(l.encrypt(&Value::from("forty-two"), 0).is_err());
    }

    #[test]
    fn test_rnd_needs_right_salt() {
        let layers = stack(Onion::Det, SqlType::Integer);
        let mut v = Value::from(1);
        for l in &layers {
            v = l.encrypt(&v, 10).unwrap();
        }
        assert!(layers[2].decrypt(&v, 11).is_err());
    }

    #[test]
    fn test_hom_and_search() {
        let h = layer(Onion::Hom, SecLevel::Hom, SqlType::Integer);
        let c = h.encrypt(&Value::from(12), 1).unwrap();
        assert_eq!(h.decrypt(&c, 0).unwrap(), Value::from(12));
        assert!(h.hom_modulus().unwrap() > 1 << 59);

        let s = layer(Onion::Search, SecLevel::Search, SqlType::Text);
        let c = s.encrypt(&Value::from("hello world"), 0).unwrap();
        let token = s.search_token("world").unwrap();
        assert!(crate::crypto::search::contains_token(c.as_blob().unwrap(), &token));
        assert!(s.hom_modulus().is_err());
    }

    #[test]
    fn test_text_order_is_exact_on_prefix_only() {
        let l = layer(Onion::Ord, SecLevel::OpeJoin, SqlType::Text);
        let head = |s: &str| {
            let c = l.encrypt(&Value::from(s), 0).unwrap();
            c.as_blob().unwrap()[..OPE_BLOCK_SIZE].to_vec()
        };
        assert!(head("apple") < head("apricot"));
        assert_eq!(head("abcdefgh-one"), head("abcdefgh-two"));
        assert_ne!(
            l.encrypt(&Value::from("abcdefgh-one"), 0).unwrap(),
            l.encrypt(&Value::from("abcdefgh-two"), 0).unwrap()
        );
    }

    #[test]
    fn test_null_passes_through() {
        let l = layer(Onion::Det, SecLevel::Rnd, SqlType::Text);
        assert_eq!(l.encrypt(&Value::Null, 1).unwrap(), Value::Null);
        assert_eq!(l.decrypt(&Value::Null, 1).unwrap(), Value::Null);
    }

    #[test]
    fn test_serialized_layer_behaves_identically() {
        let l = layer(Onion::Ord, SecLevel::OpeJoin, SqlType::Text);
        let restored = Layer::from_bytes(&l.to_bytes().unwrap()).unwrap();
        let v = Value::from("carol");
        assert_eq!(l.encrypt(&v, 0).unwrap(), restored.encrypt(&v, 0).unwrap());
        assert_eq!(restored.level(), SecLevel::OpeJoin);
    }

    #[test]
    fn test_plain_level_has_no_layer() {
        let ctx = LayerContext::shared(Onion::Plain, SecLevel::PlainVal);
        assert!(Layer::derive(Onion::Plain, SecLevel::PlainVal, SqlType::Text, &master(), &ctx).is_err());
        let ctx = LayerContext::shared(Onion::Hom, SecLevel::Det);
        assert!(Layer::derive(Onion::Hom, SecLevel::Det, SqlType::Integer, &master(), &ctx).is_err());
    }
}
