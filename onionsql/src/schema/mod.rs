//! Schema metadata: Database -> Table -> Field -> Onion.
//!
//! Each node owns its children exclusively. Every table, onion column and
//! salt column carries an anonymized name that is generated once and never
//! changes; the store only ever sees those names. Lookups here are by logical
//! name only. Aliases are resolved by the analysis session.
//!
//! The tree is an explicit context object: a proxy owns one
//! [`SchemaMetadata`], and every analysis and rewrite call borrows it.

pub mod mirror;
mod names;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use secrecy::SecretVec;

use crate::crypto::context::LayerContext;
use crate::crypto::{Layer, Onion, SecLevel, SqlType};
use crate::error::Error;
use crate::value::Value;

pub use names::NameRegistry;

/// Fully qualified logical name of a field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldRef {
    /// Database name
    pub database: String,
    /// Logical table name
    pub table: String,
    /// Logical column name
    pub field: String,
}

impl FieldRef {
    /// Creates a field reference.
    #[must_use]
    pub fn new(database: impl Into<String>, table: impl Into<String>, field: impl Into<String>) -> Self {
        Self { database: database.into(), table: table.into(), field: field.into() }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.table, self.field)
    }
}

/// Which onions a field carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnionLayout {
    /// Plaintext only
    Plain,
    /// Integers: equality, order, addition
    Numeric,
    /// Text: equality, order, word search
    Text,
    /// Blobs: equality
    Bytes,
}

impl OnionLayout {
    /// Layout for a declared type under the encrypt-by-default policy.
    #[must_use]
    pub const fn for_type(sql_type: SqlType, encrypted: bool) -> Self {
        if !encrypted {
            return Self::Plain;
        }
        match sql_type {
            SqlType::Integer => Self::Numeric,
            SqlType::Text => Self::Text,
            SqlType::Blob => Self::Bytes,
        }
    }

    /// Onions of the layout.
    #[must_use]
    pub const fn onions(self) -> &'static [Onion] {
        match self {
            Self::Plain => &[Onion::Plain],
            Self::Numeric => &[Onion::Det, Onion::Ord, Onion::Hom],
            Self::Text => &[Onion::Det, Onion::Ord, Onion::Search],
            Self::Bytes => &[Onion::Det],
        }
    }

    /// Persisted tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Numeric => "NUM",
            Self::Text => "STR",
            Self::Bytes => "BYTES",
        }
    }
}

impl FromStr for OnionLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLAIN" => Ok(Self::Plain),
            "NUM" => Ok(Self::Numeric),
            "STR" => Ok(Self::Text),
            "BYTES" => Ok(Self::Bytes),
            other => Err(Error::MetadataConflict(format!("unknown onion layout `{other}`"))),
        }
    }
}

/// One onion of one field: its physical column and layer stack.
#[derive(Debug, Clone)]
pub struct OnionMetadata {
    onion: Onion,
    anon_name: String,
    sql_type: SqlType,
    layers: Vec<Layer>,
}

impl OnionMetadata {
    /// Builds a new onion with every layer of its chain, derived from the master key.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer key cannot be derived.
    pub fn create(
        onion: Onion,
        sql_type: SqlType,
        anon_table: &str,
        names: &mut NameRegistry,
        master: &SecretVec<u8>,
    ) -> Result<Self, Error> {
        let anon_name = names.generate("col");
        let layers = onion
            .chain()
            .iter()
            .filter(|level| **level != SecLevel::PlainVal)
            .map(|level| {
                let context = LayerContext::new(anon_table, &anon_name, onion, *level);
                Layer::derive(onion, *level, sql_type, master, &context)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { onion, anon_name, sql_type, layers })
    }

    /// Rebuilds an onion from persisted layers, weakest first.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the layers are not a prefix of the
    /// onion's chain.
    pub fn restore(
        onion: Onion,
        anon_name: impl Into<String>,
        sql_type: SqlType,
        layers: Vec<Layer>,
    ) -> Result<Self, Error> {
        let anon_name = anon_name.into();
        let expected = onion.chain().iter().filter(|level| **level != SecLevel::PlainVal);
        for (layer, level) in layers.iter().zip(expected) {
            if layer.onion() != onion || layer.level() != *level {
                return Err(Error::MetadataConflict(format!(
                    "onion {anon_name}: layer {}@{} out of place",
                    layer.onion(),
                    layer.level()
                )));
            }
        }
        if layers.len() > onion.chain().len() {
            return Err(Error::MetadataConflict(format!("onion {anon_name}: too many layers")));
        }
        Ok(Self { onion, anon_name, sql_type, layers })
    }

    /// Returns the onion.
    #[must_use]
    pub const fn onion(&self) -> Onion {
        self.onion
    }

    /// Returns the anonymized physical column name.
    #[must_use]
    pub fn anon_name(&self) -> &str {
        &self.anon_name
    }

    /// Returns the declared type of the field.
    #[must_use]
    pub const fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    /// Physical column type.
    #[must_use]
    pub fn physical_type(&self) -> SqlType {
        if self.layers.is_empty() {
            self.sql_type
        } else {
            SqlType::Blob
        }
    }

    /// Current level: the outermost layer's, or plaintext if none remain.
    #[must_use]
    pub fn level(&self) -> SecLevel {
        self.layers.last().map_or(SecLevel::PlainVal, Layer::level)
    }

    /// Layers, weakest first.
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Outermost layer.
    #[must_use]
    pub fn outermost(&self) -> Option<&Layer> {
        self.layers.last()
    }

    /// Layer at `level`, if it is still on the stack.
    #[must_use]
    pub fn layer_at(&self, level: SecLevel) -> Option<&Layer> {
        self.layers.iter().find(|layer| layer.level() == level)
    }

    /// Removes the outermost layer.
    pub fn pop_layer(&mut self) -> Option<Layer> {
        self.layers.pop()
    }

    /// Encrypts a plaintext up to `level`.
    ///
    /// # Errors
    ///
    /// Returns `Error::EncryptionFailed` if `level` is above the current
    /// level, or a layer rejects the value.
    pub fn encrypt_to(&self, value: &Value, level: SecLevel, salt: u64) -> Result<Value, Error> {
        if level > self.level() {
            return Err(Error::EncryptionFailed(format!(
                "{} is above the current {} level of {}",
                level,
                self.onion,
                self.level()
            )));
        }
        self.layers
            .iter()
            .take_while(|layer| layer.level() <= level)
            .try_fold(value.clone(), |v, layer| layer.encrypt(&v, salt))
    }

    /// Decrypts a value held at `level` back to plaintext.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if a layer rejects the value.
    pub fn decrypt_from(&self, value: &Value, level: SecLevel, salt: u64) -> Result<Value, Error> {
        self.layers
            .iter()
            .rev()
            .filter(|layer| layer.level() <= level)
            .try_fold(value.clone(), |v, layer| layer.decrypt(&v, salt))
    }
}

/// A logical column.
#[derive(Debug, Clone)]
pub struct FieldMetadata {
    field_ref: FieldRef,
    index: u32,
    sql_type: SqlType,
    layout: OnionLayout,
    salt_name: Option<String>,
    onions: BTreeMap<Onion, OnionMetadata>,
}

impl FieldMetadata {
    /// Creates a field with no onions registered yet.
    #[must_use]
    pub const fn new(
        field_ref: FieldRef,
        index: u32,
        sql_type: SqlType,
        layout: OnionLayout,
        salt_name: Option<String>,
    ) -> Self {
        Self { field_ref, index, sql_type, layout, salt_name, onions: BTreeMap::new() }
    }

    /// Registers an onion under this field.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the onion already exists or is not
    /// part of the field's layout.
    pub fn create_onion(&mut self, onion: OnionMetadata) -> Result<&mut OnionMetadata, Error> {
        let kind = onion.onion();
        if !self.layout.onions().contains(&kind) {
            return Err(Error::MetadataConflict(format!(
                "{kind} onion is not part of the {} layout of {}",
                self.layout.tag(),
                self.field_ref
            )));
        }
        if self.onions.contains_key(&kind) {
            return Err(Error::MetadataConflict(format!("{} already has a {kind} onion", self.field_ref)));
        }
        Ok(self.onions.entry(kind).or_insert(onion))
    }

    /// Returns the qualified name.
    #[must_use]
    pub const fn field_ref(&self) -> &FieldRef {
        &self.field_ref
    }

    /// Returns the logical column name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.field_ref.field
    }

    /// Ordinal index within the table.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Declared type.
    #[must_use]
    pub const fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    /// Onion layout blueprint.
    #[must_use]
    pub const fn layout(&self) -> OnionLayout {
        self.layout
    }

    /// Anonymized salt column, if the field is salted.
    #[must_use]
    pub fn salt_name(&self) -> Option<&str> {
        self.salt_name.as_deref()
    }

    /// Returns `true` if the field carries a per-row salt.
    #[must_use]
    pub const fn has_salt(&self) -> bool {
        self.salt_name.is_some()
    }

    /// Returns `true` iff the only onion is the plaintext one.
    #[must_use]
    pub fn is_plain(&self) -> bool {
        self.onions.len() == 1 && self.onions.contains_key(&Onion::Plain)
    }

    /// Looks up one onion.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the field has no such onion.
    pub fn onion(&self, onion: Onion) -> Result<&OnionMetadata, Error> {
        self.onions
            .get(&onion)
            .ok_or_else(|| Error::MetadataConflict(format!("{} has no {onion} onion", self.field_ref)))
    }

    /// Looks up one onion mutably.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the field has no such onion.
    pub fn onion_mut(&mut self, onion: Onion) -> Result<&mut OnionMetadata, Error> {
        let field = &self.field_ref;
        self.onions
            .get_mut(&onion)
            .ok_or_else(|| Error::MetadataConflict(format!("{field} has no {onion} onion")))
    }

    /// Iterates over the onions in onion order.
    pub fn onions(&self) -> impl Iterator<Item = (&Onion, &OnionMetadata)> {
        self.onions.iter()
    }

    /// Physical columns of this field: every onion, then the salt.
    #[must_use]
    pub fn physical_columns(&self) -> Vec<(String, SqlType)> {
        let mut columns: Vec<(String, SqlType)> = self
            .onions
            .values()
            .map(|om| (om.anon_name().to_string(), om.physical_type()))
            .collect();
        if let Some(salt) = &self.salt_name {
            columns.push((salt.clone(), SqlType::Integer));
        }
        columns
    }
}

/// A logical table.
#[derive(Debug, Clone)]
pub struct TableMetadata {
    name: String,
    database: String,
    anon_name: String,
    number: u64,
    fields: Vec<FieldMetadata>,
}

impl TableMetadata {
    /// Creates a table with no fields.
    #[must_use]
    pub fn new(
        database: impl Into<String>,
        name: impl Into<String>,
        anon_name: impl Into<String>,
        number: u64,
    ) -> Self {
        Self {
            name: name.into(),
            database: database.into(),
            anon_name: anon_name.into(),
            number,
            fields: Vec::new(),
        }
    }

    /// Registers a field under this table.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if a field of that name exists.
    pub fn create_field(&mut self, field: FieldMetadata) -> Result<&mut FieldMetadata, Error> {
        if self.fields.iter().any(|f| f.name() == field.name()) {
            return Err(Error::MetadataConflict(format!("field {} already exists", field.field_ref())));
        }
        let pos = self.fields.partition_point(|f| f.index() <= field.index());
        self.fields.insert(pos, field);
        Ok(&mut self.fields[pos])
    }

    /// Removes a field with its onions.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if no such field exists.
    pub fn destroy_field(&mut self, name: &str) -> Result<FieldMetadata, Error> {
        let pos = self
            .fields
            .iter()
            .position(|f| f.name() == name)
            .ok_or_else(|| self.missing_field(name))?;
        Ok(self.fields.remove(pos))
    }

    /// Looks up a field by logical name.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if no such field exists.
    pub fn field(&self, name: &str) -> Result<&FieldMetadata, Error> {
        self.fields.iter().find(|f| f.name() == name).ok_or_else(|| self.missing_field(name))
    }

    /// Looks up a field mutably.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if no such field exists.
    pub fn field_mut(&mut self, name: &str) -> Result<&mut FieldMetadata, Error> {
        let missing = self.missing_field(name);
        self.fields.iter_mut().find(|f| f.name() == name).ok_or(missing)
    }

    /// Returns `true` if the table has a field of that name.
    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name() == name)
    }

    /// Fields in ordinal order.
    #[must_use]
    pub fn fields(&self) -> &[FieldMetadata] {
        &self.fields
    }

    /// Index for the next added field.
    #[must_use]
    pub fn next_index(&self) -> u32 {
        self.fields.iter().map(|f| f.index() + 1).max().unwrap_or(0)
    }

    /// Logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning database.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Anonymized physical name.
    #[must_use]
    pub fn anon_name(&self) -> &str {
        &self.anon_name
    }

    /// Numeric table id.
    #[must_use]
    pub const fn number(&self) -> u64 {
        self.number
    }

    /// Returns `true` if any field is encrypted.
    #[must_use]
    pub fn has_sensitive(&self) -> bool {
        self.fields.iter().any(|f| !f.is_plain())
    }

    /// Returns `true` if any field is salted.
    #[must_use]
    pub fn has_salt(&self) -> bool {
        self.fields.iter().any(FieldMetadata::has_salt)
    }

    fn missing_field(&self, name: &str) -> Error {
        Error::MetadataConflict(format!("no field {}.{}.{name}", self.database, self.name))
    }
}

/// A database: a namespace of tables.
#[derive(Debug, Clone, Default)]
pub struct DatabaseMetadata {
    tables: BTreeMap<String, TableMetadata>,
}

impl DatabaseMetadata {
    /// Tables by logical name.
    pub fn tables(&self) -> impl Iterator<Item = &TableMetadata> {
        self.tables.values()
    }
}

/// Root of the metadata tree.
#[derive(Debug, Default)]
pub struct SchemaMetadata {
    databases: BTreeMap<String, DatabaseMetadata>,
    names: NameRegistry,
    next_table_number: u64,
}

impl SchemaMetadata {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a table with a fresh anonymized name.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the table already exists.
    pub fn create_table(&mut self, database: &str, name: &str) -> Result<&mut TableMetadata, Error> {
        if self.has_table(database, name) {
            return Err(Error::MetadataConflict(format!("table {database}.{name} already exists")));
        }
        let anon_name = self.names.generate("tbl");
        let number = self.next_table_number;
        self.insert_table(TableMetadata::new(database, name, anon_name, number))
    }

    /// Registers a fully built table, reserving all of its anonymized names.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the table already exists.
    pub fn insert_table(&mut self, table: TableMetadata) -> Result<&mut TableMetadata, Error> {
        if self.has_table(table.database(), table.name()) {
            return Err(Error::MetadataConflict(format!(
                "table {}.{} already exists",
                table.database(),
                table.name()
            )));
        }
        self.names.reserve(table.anon_name());
        for field in table.fields() {
            if let Some(salt) = field.salt_name() {
                self.names.reserve(salt);
            }
            for (_, onion) in field.onions() {
                self.names.reserve(onion.anon_name());
            }
        }
        self.next_table_number = self.next_table_number.max(table.number() + 1);
        let tables = &mut self.databases.entry(table.database().to_string()).or_default().tables;
        Ok(tables.entry(table.name().to_string()).or_insert(table))
    }

    /// Builds a field with all of its onions, ready to register on its table.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the table is missing, or a key
    /// derivation error.
    pub fn build_field(
        &mut self,
        field_ref: FieldRef,
        sql_type: SqlType,
        encrypted: bool,
        master: &SecretVec<u8>,
    ) -> Result<FieldMetadata, Error> {
        let table = self.table(&field_ref.database, &field_ref.table)?;
        let anon_table = table.anon_name().to_string();
        let index = table.next_index();

        let layout = OnionLayout::for_type(sql_type, encrypted);
        let salt_name = (layout != OnionLayout::Plain).then(|| self.names.generate("salt"));
        let mut field = FieldMetadata::new(field_ref, index, sql_type, layout, salt_name);
        for onion in layout.onions() {
            let meta = OnionMetadata::create(*onion, sql_type, &anon_table, &mut self.names, master)?;
            field.create_onion(meta)?;
        }
        Ok(field)
    }

    /// Removes a table with all of its fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if no such table exists.
    pub fn destroy_table(&mut self, database: &str, name: &str) -> Result<TableMetadata, Error> {
        self.databases
            .get_mut(database)
            .and_then(|db| db.tables.remove(name))
            .ok_or_else(|| missing_table(database, name))
    }

    /// Returns `true` if the table exists.
    #[must_use]
    pub fn has_table(&self, database: &str, name: &str) -> bool {
        self.databases.get(database).is_some_and(|db| db.tables.contains_key(name))
    }

    /// Looks up a table by logical name.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if no such table exists.
    pub fn table(&self, database: &str, name: &str) -> Result<&TableMetadata, Error> {
        self.databases
            .get(database)
            .and_then(|db| db.tables.get(name))
            .ok_or_else(|| missing_table(database, name))
    }

    /// Looks up a table mutably.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if no such table exists.
    pub fn table_mut(&mut self, database: &str, name: &str) -> Result<&mut TableMetadata, Error> {
        self.databases
            .get_mut(database)
            .and_then(|db| db.tables.get_mut(name))
            .ok_or_else(|| missing_table(database, name))
    }

    /// Looks up a field.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the table or field is missing.
    pub fn field(&self, field: &FieldRef) -> Result<&FieldMetadata, Error> {
        self.table(&field.database, &field.table)?.field(&field.field)
    }

    /// Looks up a field mutably.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the table or field is missing.
    pub fn field_mut(&mut self, field: &FieldRef) -> Result<&mut FieldMetadata, Error> {
        self.table_mut(&field.database, &field.table)?.field_mut(&field.field)
    }

    /// Databases by name.
    pub fn databases(&self) -> impl Iterator<Item = (&String, &DatabaseMetadata)> {
        self.databases.iter()
    }

    /// Anonymized name registry.
    #[must_use]
    pub const fn names(&self) -> &NameRegistry {
        &self.names
    }
}

fn missing_table(database: &str, name: &str) -> Error {
    Error::MetadataConflict(format!("no table {database}.{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master() -> SecretVec<u8> {
        SecretVec::new(vec![0x5a; 32])
    }

    fn schema_with_users() -> SchemaMetadata {
        let mut schema = SchemaMetadata::new();
        schema.create_table("app", "users").unwrap();
        for (name, ty, enc) in [("id", SqlType::Integer, true), ("name", SqlType::Text, true), ("note", SqlType::Text, false)] {
            let field = schema.build_field(FieldRef::new("app", "users", name), ty, enc, &master()).unwrap();
            schema.table_mut("app", "users").unwrap().create_field(field).unwrap();
        }
        schema
    }

    #[test]
    fn test_create_and_lookup() {
        let schema = schema_with_users();
        let users = schema.table("app", "users").unwrap();

        assert!(users.anon_name().starts_with("tbl_"));
        assert_eq!(users.fields().len(), 3);
        assert_eq!(users.fields()[1].name(), "name");
        assert_eq!(users.fields()[2].index(), 2);
        assert!(users.has_sensitive());
    }

    #[test]
    fn test_layouts() {
        let schema = schema_with_users();
        let id = schema.field(&FieldRef::new("app", "users", "id")).unwrap();
        let onions: Vec<Onion> = id.onions().map(|(o, _)| *o).collect();
        assert_eq!(onions, vec![Onion::Det, Onion::Ord, Onion::Hom]);
        assert_eq!(id.onion(Onion::Det).unwrap().level(), SecLevel::Rnd);
        assert!(id.has_salt());

        let note = schema.field(&FieldRef::new("app", "users", "note")).unwrap();
        assert!(note.is_plain());
        assert!(!note.has_salt());
        assert_eq!(note.onion(Onion::Plain).unwrap().level(), SecLevel::PlainVal);
        assert_eq!(note.physical_columns().len(), 1);
    }

    #[test]
    fn test_duplicates_conflict() {
        let mut schema = schema_with_users();
        assert!(matches!(schema.create_table("app", "users"), Err(Error::MetadataConflict(_))));

        let dup = schema.build_field(FieldRef::new("app", "users", "id"), SqlType::Integer, true, &master()).unwrap();
        assert!(schema.table_mut("app", "users").unwrap().create_field(dup).is_err());
    }

    #[test]
    fn test_missing_lookups_conflict() {
        let schema = schema_with_users();
        assert!(schema.table("app", "orders").is_err());
        assert!(schema.table("other", "users").is_err());
        assert!(schema.field(&FieldRef::new("app", "users", "email")).is_err());
        let id = schema.field(&FieldRef::new("app", "users", "id")).unwrap();
        assert!(id.onion(Onion::Search).is_err());
    }

    #[test]
    fn test_destroy_cascades() {
        let mut schema = schema_with_users();
        let table = schema.destroy_table("app", "users").unwrap();
        assert_eq!(table.fields().len(), 3);
        assert!(!schema.has_table("app", "users"));
        assert!(schema.destroy_table("app", "users").is_err());
    }

    #[test]
    fn test_names_unique_across_tree() {
        let schema = schema_with_users();
        let users = schema.table("app", "users").unwrap();
        let mut seen = std::collections::HashSet::new();
        assert!(seen.insert(users.anon_name().to_string()));
        for field in users.fields() {
            for (name, _) in field.physical_columns() {
                assert!(seen.insert(name), "duplicate physical name");
            }
        }
    }

    #[test]
    fn test_next_index_after_drop() {
        let mut schema = schema_with_users();
        schema.table_mut("app", "users").unwrap().destroy_field("name").unwrap();
        assert_eq!(schema.table("app", "users").unwrap().next_index(), 3);
    }

    #[test]
    fn test_onion_encrypt_decrypt_at_each_level() {
        let schema = schema_with_users();
        let id = schema.field(&FieldRef::new("app", "users", "id")).unwrap();
        for (_, onion) in id.onions() {
            for level in onion.onion().chain() {
                let c = onion.encrypt_to(&Value::from(31), *level, 8).unwrap();
                assert_eq!(onion.decrypt_from(&c, *level, 8).unwrap(), Value::from(31));
            }
        }
    }

    #[test]
    fn test_restore_rejects_out_of_place_layers() {
        let schema = schema_with_users();
        let det = schema.field(&FieldRef::new("app", "users", "id")).unwrap().onion(Onion::Det).unwrap();
        let layers = vec![det.layers()[1].clone()];
        assert!(OnionMetadata::restore(Onion::Det, "col_x", SqlType::Integer, layers).is_err());

        let layers = det.layers()[..2].to_vec();
        let restored = OnionMetadata::restore(Onion::Det, "col_x", SqlType::Integer, layers).unwrap();
        assert_eq!(restored.level(), SecLevel::Det);
    }
}
