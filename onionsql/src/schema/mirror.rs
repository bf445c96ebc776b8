//! Persisted relational mirror of the metadata tree.
//!
//! One row per table, field, onion and layer, linked by surrogate ids with
//! cascading deletes. On startup [`MetaMirror::load`] rebuilds the tree from
//! the persisted key material alone, so a partially peeled onion comes back
//! exactly as it was left.
//!
//! Peeling a layer is bracketed by a write-ahead intent in `adjustment_log`:
//! the intent is written before the live column is rewritten and removed in
//! the same transaction that records the new level. A leftover intent means
//! the process died between the two.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use super::{FieldMetadata, FieldRef, OnionMetadata, SchemaMetadata, TableMetadata};
use crate::crypto::{Layer, Onion, SecLevel, SqlType};
use crate::error::Error;

const SCHEMA: &str = r"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS table_info (
    id INTEGER PRIMARY KEY,
    number INTEGER NOT NULL UNIQUE,
    anonymous_name TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    has_sensitive INTEGER NOT NULL,
    has_salt INTEGER NOT NULL,
    salt_name TEXT NOT NULL DEFAULT '',
    database_name TEXT NOT NULL,
    UNIQUE (database_name, name)
);

CREATE TABLE IF NOT EXISTS field_info (
    id INTEGER PRIMARY KEY,
    table_info_id INTEGER NOT NULL REFERENCES table_info (id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    ndex INTEGER NOT NULL,
    sql_type TEXT NOT NULL,
    has_salt INTEGER NOT NULL,
    salt_name TEXT,
    onion_layout TEXT NOT NULL,
    UNIQUE (table_info_id, name)
);

CREATE TABLE IF NOT EXISTS onion_info (
    id INTEGER PRIMARY KEY,
    field_info_id INTEGER NOT NULL REFERENCES field_info (id) ON DELETE CASCADE,
    name TEXT NOT NULL UNIQUE,
    type TEXT NOT NULL,
    current_level TEXT NOT NULL,
    sql_type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS layer_key (
    id INTEGER PRIMARY KEY,
    onion_info_id INTEGER NOT NULL REFERENCES onion_info (id) ON DELETE CASCADE,
    lkey BLOB NOT NULL,
    type TEXT NOT NULL,
    level TEXT NOT NULL,
    len INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS adjustment_log (
    id INTEGER PRIMARY KEY,
    onion_name TEXT NOT NULL,
    from_level TEXT NOT NULL,
    to_level TEXT NOT NULL
);
";

/// An adjustment intent that was written but never completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAdjustment {
    /// Intent row id
    pub id: i64,
    /// Anonymized onion column name
    pub onion: String,
    /// Level before the peel
    pub from: SecLevel,
    /// Level the peel was heading to
    pub to: SecLevel,
}

/// SQLite-backed persisted copy of the schema metadata.
pub struct MetaMirror {
    conn: Connection,
}

impl MetaMirror {
    /// Opens (or creates) a mirror. `None` keeps it in memory.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the database cannot be opened or migrated.
    pub fn open(path: Option<&Path>) -> Result<Self, Error> {
        let conn = match path {
            Some(path) => {
                debug!(path = %path.display(), "opening metadata mirror");
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Rebuilds the in-memory metadata tree.
    ///
    /// Layers are re-instantiated from their serialized key material, from
    /// the bottom of each chain up to the onion's recorded current level.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if a row is malformed or a layer is
    /// missing, and `Error::Store` on query failure.
    pub fn load(&self) -> Result<SchemaMetadata, Error> {
        let mut schema = SchemaMetadata::new();
        let tables = self
            .conn
            .prepare("SELECT id, number, anonymous_name, name, database_name FROM table_info ORDER BY number")?
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (id, number, anon_name, name, database) in tables {
            let mut table = TableMetadata::new(&database, &name, anon_name, number);
            for field in self.load_fields(id, &database, &name)? {
                table.create_field(field)?;
            }
            schema.insert_table(table)?;
        }
        Ok(schema)
    }

    fn load_fields(&self, table_id: i64, database: &str, table: &str) -> Result<Vec<FieldMetadata>, Error> {
        let rows = self
            .conn
            .prepare(
                "SELECT id, name, ndex, sql_type, salt_name, onion_layout FROM field_info
                 WHERE table_info_id = ?1 ORDER BY ndex",
            )?
            .query_map([table_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut fields = Vec::with_capacity(rows.len());
        for (id, name, index, sql_type, salt_name, layout) in rows {
            let field_ref = FieldRef::new(database, table, name);
            let mut field = FieldMetadata::new(field_ref, index, sql_type.parse()?, layout.parse()?, salt_name);
            for onion in self.load_onions(id)? {
                field.create_onion(onion)?;
            }
            fields.push(field);
        }
        Ok(fields)
    }

    fn load_onions(&self, field_id: i64) -> Result<Vec<OnionMetadata>, Error> {
        let rows = self
            .conn
            .prepare("SELECT id, name, type, current_level, sql_type FROM onion_info WHERE field_info_id = ?1")?
            .query_map([field_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut onions = Vec::with_capacity(rows.len());
        for (id, anon_name, onion, current, sql_type) in rows {
            let onion: Onion = onion.parse()?;
            let current: SecLevel = current.parse()?;
            let sql_type: SqlType = sql_type.parse()?;

            let keys = self
                .conn
                .prepare("SELECT level, lkey FROM layer_key WHERE onion_info_id = ?1")?
                .query_map([id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut layers = Vec::new();
            for level in onion.chain().iter().filter(|l| **l != SecLevel::PlainVal && **l <= current) {
                let (_, lkey) = keys.iter().find(|(tag, _)| tag == level.tag()).ok_or_else(|| {
                    Error::MetadataConflict(format!("onion {anon_name} has no persisted {level} layer"))
                })?;
                layers.push(Layer::from_bytes(lkey)?);
            }

            let restored = OnionMetadata::restore(onion, &anon_name, sql_type, layers)?;
            if restored.level() != current {
                return Err(Error::MetadataConflict(format!(
                    "onion {anon_name} recorded at {current} but restored at {}",
                    restored.level()
                )));
            }
            onions.push(restored);
        }
        Ok(onions)
    }

    /// Persists a new table with all of its fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the table exists or a write fails.
    pub fn insert_table(&mut self, table: &TableMetadata) -> Result<(), Error> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO table_info (number, anonymous_name, name, has_sensitive, has_salt, database_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                table.number(),
                table.anon_name(),
                table.name(),
                table.has_sensitive(),
                table.has_salt(),
                table.database(),
            ],
        )?;
        let table_id = tx.last_insert_rowid();
        for field in table.fields() {
            insert_field_rows(&tx, table_id, field)?;
        }
        tx.commit()?;
        info!(table = %table.name(), anon = %table.anon_name(), "persisted table metadata");
        Ok(())
    }

    /// Persists one field added to an existing table.
    ///
    /// `table` is the table as it stands after the field was registered.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the table is not persisted, or
    /// `Error::Store` on write failure.
    pub fn insert_field(&mut self, table: &TableMetadata, field: &FieldMetadata) -> Result<(), Error> {
        let tx = self.conn.transaction()?;
        let table_id = table_id(&tx, table)?;
        insert_field_rows(&tx, table_id, field)?;
        update_table_flags(&tx, table_id, table)?;
        tx.commit()?;
        Ok(())
    }

    /// Deletes a table row; fields, onions and layers cascade.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` on write failure.
    pub fn delete_table(&mut self, database: &str, name: &str) -> Result<(), Error> {
        let deleted = self.conn.execute(
            "DELETE FROM table_info WHERE database_name = ?1 AND name = ?2",
            params![database, name],
        )?;
        debug!(database, table = name, deleted, "deleted table metadata");
        Ok(())
    }

    /// Deletes one field row; onions and layers cascade.
    ///
    /// `table` is the table as it stands after the field was removed.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the table is not persisted, or
    /// `Error::Store` on write failure.
    pub fn delete_field(&mut self, table: &TableMetadata, field: &str) -> Result<(), Error> {
        let tx = self.conn.transaction()?;
        let table_id = table_id(&tx, table)?;
        tx.execute(
            "DELETE FROM field_info WHERE table_info_id = ?1 AND name = ?2",
            params![table_id, field],
        )?;
        update_table_flags(&tx, table_id, table)?;
        tx.commit()?;
        Ok(())
    }

    /// Records the intent to peel `onion` from `from` down to `to`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` on write failure.
    pub fn begin_adjustment(&self, onion: &str, from: SecLevel, to: SecLevel) -> Result<i64, Error> {
        self.conn.execute(
            "INSERT INTO adjustment_log (onion_name, from_level, to_level) VALUES (?1, ?2, ?3)",
            params![onion, from.tag(), to.tag()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Commits a completed peel: records the onion's new level, drops the
    /// removed layer's key and clears the intent, in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` on write failure.
    pub fn finish_peel(&mut self, intent: i64, onion: &str, removed: SecLevel, level: SecLevel) -> Result<(), Error> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE onion_info SET current_level = ?1 WHERE name = ?2",
            params![level.tag(), onion],
        )?;
        tx.execute(
            "DELETE FROM layer_key WHERE level = ?1
             AND onion_info_id = (SELECT id FROM onion_info WHERE name = ?2)",
            params![removed.tag(), onion],
        )?;
        tx.execute("DELETE FROM adjustment_log WHERE id = ?1", [intent])?;
        tx.commit()?;
        Ok(())
    }

    /// Discards an intent whose peel never reached the store.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if no such intent is recorded, or
    /// `Error::Store` on write failure.
    pub fn abort_adjustment(&self, intent: i64) -> Result<(), Error> {
        let removed = self.conn.execute("DELETE FROM adjustment_log WHERE id = ?1", [intent])?;
        if removed == 0 {
            return Err(Error::MetadataConflict(format!("no pending adjustment #{intent}")));
        }
        Ok(())
    }

    /// Lists intents that were never completed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` on query failure, or `Error::MetadataConflict`
    /// for an unreadable level tag.
    pub fn pending_adjustments(&self) -> Result<Vec<PendingAdjustment>, Error> {
        let rows = self
            .conn
            .prepare("SELECT id, onion_name, from_level, to_level FROM adjustment_log ORDER BY id")?
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, onion, from, to)| Ok(PendingAdjustment { id, onion, from: from.parse()?, to: to.parse()? }))
            .collect()
    }
}

fn table_id(tx: &Transaction<'_>, table: &TableMetadata) -> Result<i64, Error> {
    tx.query_row(
        "SELECT id FROM table_info WHERE database_name = ?1 AND name = ?2",
        params![table.database(), table.name()],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| Error::MetadataConflict(format!("table {}.{} is not persisted", table.database(), table.name())))
}

fn update_table_flags(tx: &Transaction<'_>, table_id: i64, table: &TableMetadata) -> Result<(), Error> {
    tx.execute(
        "UPDATE table_info SET has_sensitive = ?1, has_salt = ?2 WHERE id = ?3",
        params![table.has_sensitive(), table.has_salt(), table_id],
    )?;
    Ok(())
}

fn insert_field_rows(tx: &Transaction<'_>, table_id: i64, field: &FieldMetadata) -> Result<(), Error> {
    tx.execute(
        "INSERT INTO field_info (table_info_id, name, ndex, sql_type, has_salt, salt_name, onion_layout)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            table_id,
            field.name(),
            field.index(),
            field.sql_type().tag(),
            field.has_salt(),
            field.salt_name(),
            field.layout().tag(),
        ],
    )?;
    let field_id = tx.last_insert_rowid();

    for (onion, meta) in field.onions() {
        tx.execute(
            "INSERT INTO onion_info (field_info_id, name, type, current_level, sql_type)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![field_id, meta.anon_name(), onion.tag(), meta.level().tag(), meta.sql_type().tag()],
        )?;
        let onion_id = tx.last_insert_rowid();
        for layer in meta.layers() {
            let lkey = layer.to_bytes()?;
            tx.execute(
                "INSERT INTO layer_key (onion_info_id, lkey, type, level, len) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![onion_id, lkey, onion.tag(), layer.level().tag(), lkey.len()],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use secrecy::SecretVec;

    use super::*;
    use crate::value::Value;

    fn master() -> SecretVec<u8> {
        SecretVec::new(vec![0x42; 32])
    }

    fn users(schema: &mut SchemaMetadata) -> TableMetadata {
        schema.create_table("app", "users").unwrap();
        for (name, ty, enc) in [("id", SqlType::Integer, true), ("name", SqlType::Text, true), ("tag", SqlType::Blob, false)] {
            let field = schema.build_field(FieldRef::new("app", "users", name), ty, enc, &master()).unwrap();
            schema.table_mut("app", "users").unwrap().create_field(field).unwrap();
        }
        schema.table("app", "users").unwrap().clone()
    }

    #[test]
    fn test_roundtrip_tree() {
        let mut schema = SchemaMetadata::new();
        let table = users(&mut schema);
        let mut mirror = MetaMirror::open(None).unwrap();
        mirror.insert_table(&table).unwrap();

        let loaded = mirror.load().unwrap();
        let restored = loaded.table("app", "users").unwrap();
        assert_eq!(restored.anon_name(), table.anon_name());
        assert_eq!(restored.fields().len(), 3);

        let id = FieldRef::new("app", "users", "id");
        let before = schema.field(&id).unwrap().onion(Onion::Ord).unwrap();
        let after = loaded.field(&id).unwrap().onion(Onion::Ord).unwrap();
        assert_eq!(after.anon_name(), before.anon_name());
        let c = before.encrypt_to(&Value::Integer(5), SecLevel::Rnd, 9).unwrap();
        assert_eq!(after.decrypt_from(&c, SecLevel::Rnd, 9).unwrap(), Value::Integer(5));
        assert!(loaded.names().contains(before.anon_name()));
    }

    #[test]
    fn test_peel_persists_level() {
        let mut schema = SchemaMetadata::new();
        let table = users(&mut schema);
        let mut mirror = MetaMirror::open(None).unwrap();
        mirror.insert_table(&table).unwrap();

        let name = FieldRef::new("app", "users", "name");
        let det = schema.field(&name).unwrap().onion(Onion::Det).unwrap().anon_name().to_string();
        let intent = mirror.begin_adjustment(&det, SecLevel::Rnd, SecLevel::Det).unwrap();
        assert_eq!(mirror.pending_adjustments().unwrap().len(), 1);
        mirror.finish_peel(intent, &det, SecLevel::Rnd, SecLevel::Det).unwrap();
        assert!(mirror.pending_adjustments().unwrap().is_empty());

        let loaded = mirror.load().unwrap();
        let onion = loaded.field(&name).unwrap().onion(Onion::Det).unwrap();
        assert_eq!(onion.level(), SecLevel::Det);
        assert_eq!(onion.layers().len(), 2);
    }

    #[test]
    fn test_abort_adjustment_keeps_level() {
        let mut schema = SchemaMetadata::new();
        let table = users(&mut schema);
        let mut mirror = MetaMirror::open(None).unwrap();
        mirror.insert_table(&table).unwrap();

        let name = FieldRef::new("app", "users", "name");
        let det = schema.field(&name).unwrap().onion(Onion::Det).unwrap().anon_name().to_string();
        let intent = mirror.begin_adjustment(&det, SecLevel::Rnd, SecLevel::Det).unwrap();
        mirror.abort_adjustment(intent).unwrap();
        assert!(mirror.pending_adjustments().unwrap().is_empty());
        assert!(matches!(mirror.abort_adjustment(intent), Err(Error::MetadataConflict(_))));

        let loaded = mirror.load().unwrap();
        assert_eq!(loaded.field(&name).unwrap().onion(Onion::Det).unwrap().level(), SecLevel::Rnd);
    }

    #[test]
    fn test_field_changes_and_cascade() {
        let mut schema = SchemaMetadata::new();
        let table = users(&mut schema);
        let mut mirror = MetaMirror::open(None).unwrap();
        mirror.insert_table(&table).unwrap();

        let extra = schema.build_field(FieldRef::new("app", "users", "age"), SqlType::Integer, true, &master()).unwrap();
        let table = schema.table_mut("app", "users").unwrap();
        table.create_field(extra.clone()).unwrap();
        mirror.insert_field(table, &extra).unwrap();
        assert_eq!(mirror.load().unwrap().table("app", "users").unwrap().fields().len(), 4);

        table.destroy_field("name").unwrap();
        mirror.delete_field(table, "name").unwrap();
        let loaded = mirror.load().unwrap();
        let names: Vec<&str> = loaded.table("app", "users").unwrap().fields().iter().map(FieldMetadata::name).collect();
        assert_eq!(names, vec!["id", "tag", "age"]);

        mirror.delete_table("app", "users").unwrap();
        assert!(!mirror.load().unwrap().has_table("app", "users"));
        let orphans: i64 = mirror.conn.query_row("SELECT COUNT(*) FROM layer_key", [], |row| row.get(0)).unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let mut schema = SchemaMetadata::new();
        let table = users(&mut schema);
        let mut mirror = MetaMirror::open(None).unwrap();
        mirror.insert_table(&table).unwrap();
        assert!(mirror.insert_table(&table).is_err());
    }
}
