//! Capability algebra: what onion and level an expression can be represented at.
//!
//! An [`EncSet`] maps each onion to a [`LevelRange`]: the levels, from
//! `floor` up to `ceiling`, at which the expression can be represented or is
//! required to be, plus an optional field binding. Output sets of leaves and
//! requirement sets of operators are combined with [`EncSet::intersect`], and
//! one concrete representation is picked with [`EncSet::choose_one`].
//!
//! Invariants kept by every constructor and by `intersect`:
//!
//! - `ceiling` is a level of the onion's chain and `floor <= ceiling`.
//! - A range whose ceiling is at or below the onion's shared-key level has no
//!   binding, since those levels read the same for every field.

use std::collections::BTreeMap;
use std::fmt;

use crate::crypto::{Onion, SecLevel};
use crate::error::Error;
use crate::schema::{FieldMetadata, FieldRef};

/// Usable levels of one onion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelRange {
    /// Lowest level that still provides the operation
    pub floor: SecLevel,
    /// Highest usable level
    pub ceiling: SecLevel,
    /// Field whose keys the representation is bound to
    pub field: Option<FieldRef>,
}

/// Onion, level and field chosen for one expression occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Olk {
    /// Chosen onion
    pub onion: Onion,
    /// Chosen level
    pub level: SecLevel,
    /// Field the representation is bound to, `None` for field-independent levels
    pub field: Option<FieldRef>,
}

impl Olk {
    /// Plaintext representation.
    #[must_use]
    pub const fn plain() -> Self {
        Self { onion: Onion::Plain, level: SecLevel::PlainVal, field: None }
    }

    /// Returns `true` if the chosen representation is plaintext.
    #[must_use]
    pub fn is_plain(&self) -> bool {
        self.level == SecLevel::PlainVal
    }
}

impl fmt::Display for Olk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.onion, self.level)?;
        if let Some(field) = &self.field {
            write!(f, " of {field}")?;
        }
        Ok(())
    }
}

/// Set of usable (onion, level range, binding) entries for an expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncSet {
    entries: BTreeMap<Onion, LevelRange>,
}

impl EncSet {
    /// Set with no entries.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every onion at every level, unbound. The output of a literal.
    #[must_use]
    pub fn full() -> Self {
        let mut set = Self::empty();
        for onion in Onion::PRECEDENCE {
            set.insert(onion, SecLevel::PlainVal, onion.top(), None);
        }
        set
    }

    /// Plaintext only.
    #[must_use]
    pub fn plain() -> Self {
        Self::empty().with(Onion::Plain, SecLevel::PlainVal, SecLevel::PlainVal)
    }

    /// Output of a column: each of its onions from plaintext up to the current level.
    #[must_use]
    pub fn for_field(field: &FieldMetadata) -> Self {
        let mut set = Self::empty();
        for (onion, meta) in field.onions() {
            set.insert(*onion, SecLevel::PlainVal, meta.level(), Some(field.field_ref().clone()));
        }
        set
    }

    /// Adds an unbound requirement `[floor, ceiling]` on `onion`.
    ///
    /// The ceiling is clamped onto the onion's chain; an entry left with no
    /// chain level is not added.
    #[must_use]
    pub fn with(mut self, onion: Onion, floor: SecLevel, ceiling: SecLevel) -> Self {
        self.insert(onion, floor, ceiling, None);
        self
    }

    /// Binds every entry that is above its shared-key level to `field`.
    #[must_use]
    pub fn bound_to(mut self, field: &FieldRef) -> Self {
        for (onion, range) in &mut self.entries {
            if !is_field_independent(*onion, range.ceiling) {
                range.field = Some(field.clone());
            }
        }
        self
    }

    fn insert(&mut self, onion: Onion, floor: SecLevel, ceiling: SecLevel, field: Option<FieldRef>) {
        if let Some(range) = normalize(onion, floor, ceiling, field) {
            self.entries.insert(onion, range);
        }
    }

    /// Returns `true` if no onion survives.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the range for `onion`, if present.
    #[must_use]
    pub fn get(&self, onion: Onion) -> Option<&LevelRange> {
        self.entries.get(&onion)
    }

    /// Returns `true` if `onion` survives.
    #[must_use]
    pub fn contains(&self, onion: Onion) -> bool {
        self.entries.contains_key(&onion)
    }

    /// Iterates over the entries in onion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Onion, &LevelRange)> {
        self.entries.iter()
    }

    /// Intersects two sets.
    ///
    /// Per onion present in both, the floor is the larger floor and the
    /// ceiling the smaller ceiling. Two different field bindings can only
    /// meet at a shared-key level, so the ceiling is capped there, or the
    /// onion is dropped if it has none. Onions present in only one operand
    /// and empty ranges are dropped.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let mut out = Self::empty();
        for (onion, a) in &self.entries {
            let Some(b) = other.entries.get(onion) else {
                continue;
            };
            let mut ceiling = a.ceiling.min(b.ceiling);
            let field = match (&a.field, &b.field) {
                (Some(x), Some(y)) if x != y => {
                    let Some(shared) = onion.shared_level() else {
                        continue;
                    };
                    ceiling = ceiling.min(shared);
                    None
                }
                (x, y) => x.clone().or_else(|| y.clone()),
            };
            out.insert(*onion, a.floor.max(b.floor), ceiling, field);
        }
        out
    }

    /// Picks one representation using the fixed [`Onion::PRECEDENCE`].
    ///
    /// The first onion whose entry is bound to a field, or whose ceiling is
    /// field-independent, is chosen at its ceiling.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsatisfiableRequirement` if the set is empty or holds
    /// only unbound field-specific entries.
    pub fn choose_one(&self) -> Result<Olk, Error> {
        Onion::PRECEDENCE
            .iter()
            .filter_map(|onion| self.entries.get(onion).map(|range| (*onion, range)))
            .find(|(onion, range)| range.field.is_some() || is_field_independent(*onion, range.ceiling))
            .map(|(onion, range)| Olk { onion, level: range.ceiling, field: range.field.clone() })
            .ok_or_else(|| Error::unsatisfiable(self, "no representable onion"))
    }
}

impl fmt::Display for EncSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (onion, range)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{onion}[{}..{}]", range.floor, range.ceiling)?;
            if let Some(field) = &range.field {
                write!(f, " of {field}")?;
            }
        }
        f.write_str("}")
    }
}

fn is_field_independent(onion: Onion, level: SecLevel) -> bool {
    onion.shared_level().is_some_and(|shared| level <= shared)
}

fn normalize(
    onion: Onion,
    floor: SecLevel,
    ceiling: SecLevel,
    field: Option<FieldRef>,
) -> Option<LevelRange> {
    let ceiling = onion.clamp(ceiling)?;
    if floor > ceiling {
        return None;
    }
    let field = if is_field_independent(onion, ceiling) { None } else { field };
    Some(LevelRange { floor, ceiling, field })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str) -> FieldRef {
        FieldRef::new("db", "t", name)
    }

    fn column(name: &str) -> EncSet {
        EncSet::empty()
            .with(Onion::Det, SecLevel::PlainVal, SecLevel::Rnd)
            .with(Onion::Ord, SecLevel::PlainVal, SecLevel::Rnd)
            .with(Onion::Hom, SecLevel::PlainVal, SecLevel::Hom)
            .bound_to(&field(name))
    }

    fn equality() -> EncSet {
        EncSet::plain()
            .with(Onion::Det, SecLevel::DetJoin, SecLevel::Det)
            .with(Onion::Ord, SecLevel::OpeJoin, SecLevel::Ope)
    }

    #[test]
    fn test_equality_on_column_chooses_det() {
        let set = equality().intersect(&column("a")).intersect(&EncSet::full());
        let olk = set.choose_one().unwrap();
        assert_eq!(olk.onion, Onion::Det);
        assert_eq!(olk.level, SecLevel::Det);
        assert_eq!(olk.field, Some(field("a")));
    }

    #[test]
    fn test_cross_field_equality_uses_shared_level() {
        let set = equality().intersect(&column("a")).intersect(&column("b"));
        let olk = set.choose_one().unwrap();
        assert_eq!(olk, Olk { onion: Onion::Det, level: SecLevel::DetJoin, field: None });
    }

    #[test]
    fn test_conflicting_bindings_drop_hom() {
        let set = column("a").intersect(&column("b"));
        assert!(!set.contains(Onion::Hom));
        assert_eq!(set.get(Onion::Det).unwrap().ceiling, SecLevel::DetJoin);
    }

    #[test]
    fn test_range_below_floor_is_dropped() {
        let adjusted = EncSet::empty()
            .with(Onion::Ord, SecLevel::PlainVal, SecLevel::OpeJoin)
            .bound_to(&field("a"));
        let range = EncSet::plain().with(Onion::Ord, SecLevel::Ope, SecLevel::Ope);
        assert!(range.intersect(&adjusted).is_empty());
    }

    #[test]
    fn test_ceiling_clamped_to_chain() {
        let set = EncSet::empty().with(Onion::Det, SecLevel::PlainVal, SecLevel::Search);
        assert_eq!(set.get(Onion::Det).unwrap().ceiling, SecLevel::Det);
        assert!(EncSet::empty().with(Onion::Hom, SecLevel::PlainVal, SecLevel::Det).is_empty());
    }

    #[test]
    fn test_unbound_field_level_not_chosen() {
        let literal_only = equality().intersect(&EncSet::full());
        assert_eq!(literal_only.choose_one().unwrap(), Olk::plain());

        let no_plain = EncSet::empty().with(Onion::Det, SecLevel::Det, SecLevel::Det);
        assert!(matches!(no_plain.choose_one(), Err(Error::UnsatisfiableRequirement { .. })));
    }

    #[test]
    fn test_empty_set_unsatisfiable() {
        assert!(EncSet::empty().choose_one().is_err());
    }

    #[test]
    fn test_display() {
        let set = EncSet::plain().with(Onion::Hom, SecLevel::Hom, SecLevel::Hom).bound_to(&field("x"));
        assert_eq!(set.to_string(), "{HOM[HOM..HOM] of db.t.x, PLAIN[PLAINVAL..PLAINVAL]}");
    }
}
