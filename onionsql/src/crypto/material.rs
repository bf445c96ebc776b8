//! Serialized key material for one layer.
//!
//! The envelope is self-describing so the store-side peel function can
//! rebuild a layer from a single blob:
//!
//! ```text
//! [version: u8]
//! [onion tag len: u8][onion tag]
//! [level tag len: u8][level tag]
//! [sql type: u8]
//! [key len: u16 BE][key]
//! ```

use secrecy::{ExposeSecret, SecretVec};
use zeroize::Zeroizing;

use super::{Onion, SecLevel, SqlType};
use crate::error::Error;

/// Version of the key material format.
pub const MATERIAL_VERSION: u8 = 1;

/// Key material of one layer together with what it is for.
pub struct KeyMaterial {
    onion: Onion,
    level: SecLevel,
    sql_type: SqlType,
    key: SecretVec<u8>,
}

impl KeyMaterial {
    /// Bundles a layer key with its identity.
    #[must_use]
    pub const fn new(onion: Onion, level: SecLevel, sql_type: SqlType, key: SecretVec<u8>) -> Self {
        Self { onion, level, sql_type, key }
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

    /// Returns the declared type of the column the layer protects.
    #[must_use]
    pub const fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    /// Returns the key.
    #[must_use]
    pub const fn key(&self) -> &SecretVec<u8> {
        &self.key
    }

    /// Serializes the envelope.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyMaterial` if the key exceeds 65535 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let key = self.key.expose_secret();
        let key_len = u16::try_from(key.len()).map_err(|_| {
            Error::InvalidKeyMaterial(format!("key too long: {} bytes (max: 65535)", key.len()))
        })?;

        let onion = self.onion.tag().as_bytes();
        let level = self.level.tag().as_bytes();

        let mut bytes = Vec::with_capacity(6 + onion.len() + level.len() + key.len());
        bytes.push(MATERIAL_VERSION);
        push_tag(&mut bytes, onion);
        push_tag(&mut bytes, level);
        bytes.push(self.sql_type.code());
        bytes.extend_from_slice(&key_len.to_be_bytes());
        bytes.extend_from_slice(key);

        Ok(bytes)
    }

    /// Parses an envelope.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedVersion` for an unknown version and
    /// `Error::InvalidKeyMaterial` for truncated or malformed data.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader { data, pos: 0 };

        let version = reader.byte("version")?;
        if version != MATERIAL_VERSION {
            return Err(Error::UnsupportedVersion {
                version,
                supported: MATERIAL_VERSION.to_string(),
            });
        }

        let onion: Onion = reader.tag("onion tag")?.parse()?;
        let level: SecLevel = reader.tag("level tag")?.parse()?;
        let code = reader.byte("sql type")?;
        let sql_type = SqlType::from_code(code)
            .ok_or_else(|| Error::InvalidKeyMaterial(format!("unknown sql type code {code}")))?;

        let len_bytes = reader.take(2, "key length")?;
        let key_len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
        let key = Zeroizing::new(reader.take(key_len, "key")?.to_vec());

        if reader.pos != data.len() {
            return Err(Error::InvalidKeyMaterial("trailing bytes after key".to_string()));
        }
        if !onion.contains(level) {
            return Err(Error::InvalidKeyMaterial(format!("level {level} is not on the {onion} onion")));
        }

        Ok(Self::new(onion, level, sql_type, SecretVec::new(key.to_vec())))
    }
}

fn push_tag(bytes: &mut Vec<u8>, tag: &[u8]) {
    // Tags are short static strings.
    #[allow(clippy::cast_possible_truncation)]
    bytes.push(tag.len() as u8);
    bytes.extend_from_slice(tag);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], Error> {
        if self.pos + n > self.data.len() {
            return Err(Error::InvalidKeyMaterial(format!("{what} truncated")));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self, what: &str) -> Result<u8, Error> {
        Ok(self.take(1, what)?[0])
    }

    fn tag(&mut self, what: &str) -> Result<&'a str, Error> {
        let len = usize::from(self.byte(what)?);
        std::str::from_utf8(self.take(len, what)?)
            .map_err(|e| Error::InvalidKeyMaterial(format!("invalid {what} UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KeyMaterial {
        KeyMaterial::new(Onion::Ord, SecLevel::Ope, SqlType::Text, SecretVec::new(vec![0xAB; 96]))
    }

    #[test]
    fn test_material_roundtrip() {
        let bytes = sample().to_bytes().unwrap();
        let parsed = KeyMaterial::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.onion(), Onion::Ord);
        assert_eq!(parsed.level(), SecLevel::Ope);
        assert_eq!(parsed.sql_type(), SqlType::Text);
        assert_eq!(parsed.key().expose_secret(), &vec![0xAB; 96]);
    }

    #[test]
    fn test_material_layout() {
        let bytes = sample().to_bytes().unwrap();
        assert_eq!(bytes[0], MATERIAL_VERSION);
        assert_eq!(bytes[1], 3);
        assert_eq!(&bytes[2..5], b"ORD");
        assert_eq!(bytes.len(), 1 + 4 + 4 + 1 + 2 + 96);
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = 9;
        assert!(matches!(
            KeyMaterial::from_bytes(&bytes),
            Err(Error::UnsupportedVersion { version: 9, .. })
        ));
    }

    #[test]
    fn test_truncated() {
        let bytes = sample().to_bytes().unwrap();
        for cut in [0, 1, 4, 10, bytes.len() - 1] {
            assert!(KeyMaterial::from_bytes(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_level_must_match_onion() {
        let bad = KeyMaterial::new(Onion::Hom, SecLevel::Det, SqlType::Integer, SecretVec::new(vec![1]));
        let bytes = bad.to_bytes().unwrap();
        assert!(KeyMaterial::from_bytes(&bytes).is_err());
    }
}
