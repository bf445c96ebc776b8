//! Error types for onionsql operations.

use std::fmt;

use crate::adjust::AdjustmentRequest;
use crate::crypto::{Onion, SecLevel};

/// Main error type for onionsql operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No capability survives for an expression; the statement cannot be rewritten.
    #[error("unsatisfiable requirement for `{expr}`: {derivation}")]
    UnsatisfiableRequirement {
        /// The expression that could not be represented
        expr: String,
        /// Human-readable derivation chain that led to the empty set
        derivation: String,
    },

    /// A column must be peeled to a lower level before the statement can proceed.
    #[error("adjustment required: {0}")]
    AdjustmentRequired(AdjustmentRequest),

    /// Duplicate creation or lookup of a missing schema entity
    #[error("metadata conflict: {0}")]
    MetadataConflict(String),

    /// Requested level is above the current one or below the bottom of the chain
    #[error("cannot adjust {onion} onion of {field} from {current} to {target}")]
    AdjustmentImpossible {
        /// Onion being adjusted
        onion: Onion,
        /// Qualified logical field name
        field: String,
        /// Level currently held
        current: SecLevel,
        /// Level that was requested
        target: SecLevel,
    },

    /// More adjustments than the configured bound were needed for one statement
    #[error("statement needed more than {limit} onion adjustments")]
    AdjustmentLimit {
        /// Configured bound
        limit: usize,
    },

    /// The mirror holds an adjustment intent that never completed
    #[error("interrupted adjustment of onion {onion} from {from} to {to}")]
    InterruptedAdjustment {
        /// Anonymized onion column name
        onion: String,
        /// Level before the peel
        from: SecLevel,
        /// Level the peel was heading to
        to: SecLevel,
    },

    /// The underlying store rejected a statement
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A multi-statement operation against a store left it in an unexpected state
    #[error("store failure: {0}")]
    StoreFailure(String),

    /// Encryption operation failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption operation failed
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// A salted value came back without its salt
    #[error("missing salt for column `{column}`")]
    MissingSalt {
        /// Output column whose salt was absent
        column: String,
    },

    /// Key has the wrong size for its layer
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required length in bytes
        expected: usize,
        /// Length that was supplied
        actual: usize,
    },

    /// Serialized key material could not be parsed
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Unsupported serialization version
    #[error("unsupported version: {version} (supported: {supported})")]
    UnsupportedVersion {
        /// The version found in the key material
        version: u8,
        /// Supported versions
        supported: String,
    },

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivation,

    /// Statement shape the proxy does not handle
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),

    /// Key provider operation failed
    #[error("key provider error: {0}")]
    KeyProvider(#[from] KeyProviderError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Builds an [`Error::UnsatisfiableRequirement`] from an expression and its derivation.
    #[must_use]
    pub fn unsatisfiable(expr: impl fmt::Display, derivation: impl fmt::Display) -> Self {
        Self::UnsatisfiableRequirement {
            expr: expr.to_string(),
            derivation: derivation.to_string(),
        }
    }

    /// Returns `true` for the one recoverable error kind.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::AdjustmentRequired(_))
    }
}

/// Errors specific to master key providers.
#[derive(Debug)]
pub enum KeyProviderError {
    /// Master key not found
    KeyNotFound(String),

    /// Key creation failed
    CreationFailed(String),

    /// Stored key is malformed
    InvalidKey(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for KeyProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyNotFound(path) => write!(f, "master key not found: {path}"),
            Self::CreationFailed(msg) => write!(f, "key creation failed: {msg}"),
            Self::InvalidKey(msg) => write!(f, "invalid master key: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KeyProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeyProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_adjustment_is_recoverable() {
        let err = Error::MetadataConflict("table t".to_string());
        assert!(!err.is_recoverable());

        let err = Error::unsatisfiable("a > 1", "ORD capped");
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("a > 1"));
    }

    #[test]
    fn test_key_provider_error_display() {
        let err = KeyProviderError::KeyNotFound("/tmp/keys/master.key".to_string());
        assert_eq!(err.to_string(), "master key not found: /tmp/keys/master.key");
    }
}
