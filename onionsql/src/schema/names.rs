//! Anonymized physical names.

use std::collections::HashSet;

use rand::{distributions::Alphanumeric, Rng};

const SUFFIX_LEN: usize = 12;

/// Issues anonymized names that are unique within one schema context.
///
/// Names loaded from the mirror are reserved so later generations never
/// collide with them.
#[derive(Debug, Default)]
pub struct NameRegistry {
    used: HashSet<String>,
}

impl NameRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a fresh `<prefix>_<random>` name and reserves it.
    pub fn generate(&mut self, prefix: &str) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let suffix: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(SUFFIX_LEN)
                .map(|b| char::from(b).to_ascii_lowercase())
                .collect();
            let name = format!("{prefix}_{suffix}");
            if self.used.insert(name.clone()) {
                return name;
            }
        }
    }

    /// Reserves an existing name. Returns `false` if it was already taken.
    pub fn reserve(&mut self, name: &str) -> bool {
        self.used.insert(name.to_string())
    }

    /// Returns `true` if `name` has been issued or reserved.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.used.contains(name)
    }
}
