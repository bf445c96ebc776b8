//! Proxy configuration, loaded from TOML.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Error;

/// Settings for one [`Proxy`](crate::proxy::Proxy).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Current database at startup.
    #[serde(default = "default_database")]
    pub database: String,

    /// New columns get encrypted onion layouts; `false` creates plaintext fields.
    #[serde(default = "default_enc_by_default")]
    pub enc_by_default: bool,

    /// SQLite file holding the metadata mirror; in memory when unset.
    #[serde(default)]
    pub metadata_path: Option<PathBuf>,

    /// Upper bound on onion adjustments for a single statement.
    #[serde(default = "default_max_adjustments")]
    pub max_adjustments: usize,

    /// Refuse to open a mirror with unfinished adjustments.
    #[serde(default = "default_fail_on_interrupted")]
    pub fail_on_interrupted_adjustment: bool,
}

fn default_database() -> String {
    "default".to_string()
}

const fn default_enc_by_default() -> bool {
    true
}

const fn default_max_adjustments() -> usize {
    64
}

const fn default_fail_on_interrupted() -> bool {
    true
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            enc_by_default: default_enc_by_default(),
            metadata_path: None,
            max_adjustments: default_max_adjustments(),
            fail_on_interrupted_adjustment: default_fail_on_interrupted(),
        }
    }
}

impl ProxyConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the document is malformed or has unknown keys.
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be read, or `Error::Config` if
    /// it does not parse.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Sets the mirror path.
    #[must_use]
    pub fn with_metadata_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.metadata_path = Some(path.into());
        self
    }
}
