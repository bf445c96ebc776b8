//! Onion families, their security levels, and declared column types.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// One independently adjustable encryption family on a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Onion {
    /// Deterministic: equality
    Det,
    /// Order-preserving: ranges, `MIN`/`MAX`, sorting
    Ord,
    /// Additively homomorphic: `+`, `SUM`
    Hom,
    /// Word search: `LIKE '%word%'`
    Search,
    /// No encryption
    Plain,
}

impl Onion {
    /// Fixed precedence used when choosing among capable onions.
    pub const PRECEDENCE: [Self; 5] = [Self::Det, Self::Ord, Self::Hom, Self::Search, Self::Plain];

    /// Levels this onion can occupy, weakest first.
    #[must_use]
    pub const fn chain(self) -> &'static [SecLevel] {
        match self {
            Self::Det => &[SecLevel::DetJoin, SecLevel::Det, SecLevel::Rnd],
            Self::Ord => &[SecLevel::OpeJoin, SecLevel::Ope, SecLevel::Rnd],
            Self::Hom => &[SecLevel::Hom],
            Self::Search => &[SecLevel::Search],
            Self::Plain => &[SecLevel::PlainVal],
        }
    }

    /// Strongest level of the chain.
    #[must_use]
    pub const fn top(self) -> SecLevel {
        match self {
            Self::Det | Self::Ord => SecLevel::Rnd,
            Self::Hom => SecLevel::Hom,
            Self::Search => SecLevel::Search,
            Self::Plain => SecLevel::PlainVal,
        }
    }

    /// Weakest level of the chain.
    #[must_use]
    pub const fn bottom(self) -> SecLevel {
        match self {
            Self::Det => SecLevel::DetJoin,
            Self::Ord => SecLevel::OpeJoin,
            Self::Hom => SecLevel::Hom,
            Self::Search => SecLevel::Search,
            Self::Plain => SecLevel::PlainVal,
        }
    }

    /// Highest level whose representation does not depend on the field, if any.
    ///
    /// Values of different fields are only comparable at or below this level.
    #[must_use]
    pub const fn shared_level(self) -> Option<SecLevel> {
        match self {
            Self::Det => Some(SecLevel::DetJoin),
            Self::Ord => Some(SecLevel::OpeJoin),
            Self::Plain => Some(SecLevel::PlainVal),
            Self::Hom | Self::Search => None,
        }
    }

    /// Returns `true` if `level` belongs to this onion's chain.
    #[must_use]
    pub fn contains(self, level: SecLevel) -> bool {
        self.chain().contains(&level)
    }

    /// Highest chain level that is not above `level`.
    #[must_use]
    pub fn clamp(self, level: SecLevel) -> Option<SecLevel> {
        self.chain().iter().rev().copied().find(|l| *l <= level)
    }

    /// Persisted tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Det => "DET",
            Self::Ord => "ORD",
            Self::Hom => "HOM",
            Self::Search => "SEARCH",
            Self::Plain => "PLAIN",
        }
    }
}

impl fmt::Display for Onion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Onion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DET" => Ok(Self::Det),
            "ORD" => Ok(Self::Ord),
            "HOM" => Ok(Self::Hom),
            "SEARCH" => Ok(Self::Search),
            "PLAIN" => Ok(Self::Plain),
            other => Err(Error::MetadataConflict(format!("unknown onion tag `{other}`"))),
        }
    }
}

/// A point on an onion's strength scale.
///
/// The order is global but each onion only uses the levels of its
/// [`Onion::chain`], which are increasing under this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecLevel {
    /// Plaintext
    PlainVal,
    /// Order-preserving under a key shared by all fields
    OpeJoin,
    /// Order-preserving under the field's own key
    Ope,
    /// Deterministic under a key shared by all fields
    DetJoin,
    /// Deterministic under the field's own key
    Det,
    /// Word-searchable
    Search,
    /// Additively homomorphic
    Hom,
    /// Randomized, salted per row
    Rnd,
}

impl SecLevel {
    /// Returns `true` if decrypting this level needs the row salt.
    #[must_use]
    pub const fn needs_salt(self) -> bool {
        matches!(self, Self::Rnd)
    }

    /// Returns `true` if the level's key is independent of the field.
    #[must_use]
    pub const fn is_shared(self) -> bool {
        matches!(self, Self::PlainVal | Self::OpeJoin | Self::DetJoin)
    }

    /// Persisted tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::PlainVal => "PLAINVAL",
            Self::OpeJoin => "OPE_JOIN",
            Self::Ope => "OPE",
            Self::DetJoin => "DET_JOIN",
            Self::Det => "DET",
            Self::Search => "SEARCH",
            Self::Hom => "HOM",
            Self::Rnd => "RND",
        }
    }
}

impl fmt::Display for SecLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for SecLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLAINVAL" => Ok(Self::PlainVal),
            "OPE_JOIN" => Ok(Self::OpeJoin),
            "OPE" => Ok(Self::Ope),
            "DET_JOIN" => Ok(Self::DetJoin),
            "DET" => Ok(Self::Det),
            "SEARCH" => Ok(Self::Search),
            "HOM" => Ok(Self::Hom),
            "RND" => Ok(Self::Rnd),
            other => Err(Error::MetadataConflict(format!("unknown level tag `{other}`"))),
        }
    }
}

/// Declared type of a logical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    /// 64-bit signed integer
    Integer,
    /// UTF-8 text
    Text,
    /// Raw bytes
    Blob,
}

impl SqlType {
    /// Persisted tag, also the SQL type name.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
        }
    }

    pub(crate) const fn code(self) -> u8 {
        match self {
            Self::Integer => 1,
            Self::Text => 2,
            Self::Blob => 3,
        }
    }

    pub(crate) const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Integer),
            2 => Some(Self::Text),
            3 => Some(Self::Blob),
            _ => None,
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for SqlType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" | "BIGINT" => Ok(Self::Integer),
            "TEXT" | "VARCHAR" => Ok(Self::Text),
            "BLOB" => Ok(Self::Blob),
            other => Err(Error::Unsupported(format!("column type `{other}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chains_are_increasing() {
        for onion in Onion::PRECEDENCE {
            let chain = onion.chain();
            assert!(chain.windows(2).all(|w| w[0] < w[1]), "{onion} chain not increasing");
            assert_eq!(chain[0], onion.bottom());
            assert_eq!(chain[chain.len() - 1], onion.top());
        }
    }

    #[test]
    fn test_shared_level_is_in_chain() {
        for onion in Onion::PRECEDENCE {
            if let Some(level) = onion.shared_level() {
                assert!(onion.contains(level));
                assert!(level.is_shared());
            }
        }
    }

    #[test]
    fn test_clamp() {
        assert_eq!(Onion::Det.clamp(SecLevel::Search), Some(SecLevel::Det));
        assert_eq!(Onion::Det.clamp(SecLevel::Ope), None);
        assert_eq!(Onion::Ord.clamp(SecLevel::Det), Some(SecLevel::Ope));
        assert_eq!(Onion::Plain.clamp(SecLevel::Rnd), Some(SecLevel::PlainVal));
    }

    #[test]
    fn test_tags_parse_back() {
        for onion in Onion::PRECEDENCE {
            assert_eq!(onion.tag().parse::<Onion>().unwrap(), onion);
            for level in onion.chain() {
                assert_eq!(level.tag().parse::<SecLevel>().unwrap(), *level);
            }
        }
        assert!("ONION".parse::<Onion>().is_err());
        assert_eq!("int".parse::<SqlType>().unwrap(), SqlType::Integer);
    }

    #[test]
    fn test_only_rnd_needs_salt() {
        assert!(SecLevel::Rnd.needs_salt());
        assert!(!SecLevel::Det.needs_salt());
        assert!(!SecLevel::Hom.needs_salt());
    }
}
