//! Context for layer key derivation and domain separation.

use std::fmt;

use super::{Onion, SecLevel};

/// Identifies one layer for key derivation and as associated data.
///
/// Field-bound layers are scoped to the anonymized table and onion column
/// names, so every field gets its own keys. Shared-key levels use a scope that
/// depends only on the onion and level, which lets values from different
/// fields meet in a comparison.
///
/// # Example
///
/// ```
/// use onionsql::crypto::context::LayerContext;
/// use onionsql::crypto::{Onion, SecLevel};
///
/// let ctx = LayerContext::new("table_ab12", "field_cd34", Onion::Det, SecLevel::Det);
/// assert_eq!(ctx.to_string(), "table_ab12|field_cd34|DET");
///
/// let join = LayerContext::new("table_ab12", "field_cd34", Onion::Det, SecLevel::DetJoin);
/// assert_eq!(join.to_string(), "shared|DET|DET_JOIN");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerContext {
    scope: Scope,
    onion: Onion,
    level: SecLevel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    Field { table: String, column: String },
    Shared,
}

impl LayerContext {
    /// Creates the context for one layer of a field's onion.
    ///
    /// Shared-key levels ignore the table and column.
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        onion: Onion,
        level: SecLevel,
    ) -> Self {
        if level.is_shared() {
            return Self::shared(onion, level);
        }
        Self { scope: Scope::Field { table: table.into(), column: column.into() }, onion, level }
    }

    /// Creates the field-independent context of a shared-key level.
    #[must_use]
    pub const fn shared(onion: Onion, level: SecLevel) -> Self {
        Self { scope: Scope::Shared, onion, level }
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

    /// Returns `true` for shared-key contexts.
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        matches!(self.scope, Scope::Shared)
    }
}

impl fmt::Display for LayerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Scope::Field { table, column } => write!(f, "{table}|{column}|{}", self.level),
            Scope::Shared => write!(f, "shared|{}|{}", self.onion, self.level),
        }
    }
}
