//! Schema statements: metadata updates plus live and scratch DDL.
//!
//! `CREATE TABLE` and `ADD COLUMN` register metadata before rewriting, since
//! the physical columns only exist once the onions are built. `DROP COLUMN`
//! and `DROP TABLE` rewrite from the metadata as it stands and remove it
//! afterwards. A create or add the stores then reject is undone with
//! [`Ddl::revert`].

use secrecy::SecretVec;
use tracing::info;

use crate::error::Error;
use crate::schema::mirror::MetaMirror;
use crate::schema::{FieldMetadata, FieldRef, SchemaMetadata, TableMetadata};
use crate::sql::{AlterOperation, AlterTable, ColumnDef, CreateTable, DropTable, Statement};

/// Statements produced by a schema change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DdlRewrite {
    /// Physical DDL for the live store
    pub live: Vec<Statement>,
    /// Logical DDL for the scratch store
    pub scratch: Vec<Statement>,
}

/// Applies schema statements to the metadata tree and its mirror.
pub struct Ddl<'a> {
    /// Metadata tree
    pub schema: &'a mut SchemaMetadata,
    /// Persisted copy of the tree
    pub mirror: &'a mut MetaMirror,
    /// Master key new layers are derived from
    pub master: &'a SecretVec<u8>,
    /// Current database
    pub database: &'a str,
    /// Whether new fields are encrypted
    pub enc_by_default: bool,
}

impl Ddl<'_> {
    /// Handles `CREATE TABLE`.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the table exists (without
    /// `IF NOT EXISTS`) or has duplicate columns, `Error::Unsupported` for a
    /// table without columns, or a mirror error. Nothing is registered on
    /// failure.
    pub fn create_table(&mut self, stmt: &CreateTable) -> Result<DdlRewrite, Error> {
        if self.schema.has_table(self.database, &stmt.name) {
            if stmt.if_not_exists {
                return Ok(DdlRewrite::default());
            }
            return Err(Error::MetadataConflict(format!("table {}.{} already exists", self.database, stmt.name)));
        }
        if stmt.columns.is_empty() {
            return Err(Error::Unsupported(format!("table `{}` has no columns", stmt.name)));
        }

        self.schema.create_table(self.database, &stmt.name)?;
        if let Err(e) = self.register(stmt) {
            self.schema.destroy_table(self.database, &stmt.name)?;
            return Err(e);
        }

        let table = self.schema.table(self.database, &stmt.name)?;
        info!(table = %stmt.name, anon = %table.anon_name(), "created table");
        let columns = table.fields().iter().flat_map(physical_defs).collect();
        Ok(DdlRewrite {
            live: vec![Statement::CreateTable(CreateTable {
                name: table.anon_name().to_string(),
                columns,
                if_not_exists: false,
            })],
            scratch: vec![Statement::CreateTable(logical_table(table))],
        })
    }

    fn register(&mut self, stmt: &CreateTable) -> Result<(), Error> {
        for column in &stmt.columns {
            let field_ref = FieldRef::new(self.database, &stmt.name, &column.name);
            let field = self.schema.build_field(field_ref, column.sql_type, self.enc_by_default, self.master)?;
            self.schema.table_mut(self.database, &stmt.name)?.create_field(field)?;
        }
        self.mirror.insert_table(self.schema.table(self.database, &stmt.name)?)
    }

    /// Handles `ALTER TABLE ... ADD COLUMN` and `... DROP COLUMN`.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` for an unknown table, an existing
    /// column on add or a missing one on drop, `Error::Unsupported` for
    /// dropping the last column, or a mirror error.
    pub fn alter_table(&mut self, stmt: &AlterTable) -> Result<DdlRewrite, Error> {
        let table = self.schema.table(self.database, &stmt.table)?;
        let anon = table.anon_name().to_string();
        match &stmt.operation {
            AlterOperation::AddColumn(def) => {
                if table.has_field(&def.name) {
                    return Err(Error::MetadataConflict(format!("column {}.{} already exists", stmt.table, def.name)));
                }
                let field_ref = FieldRef::new(self.database, &stmt.table, &def.name);
                let field = self.schema.build_field(field_ref, def.sql_type, self.enc_by_default, self.master)?;
                let live = physical_defs(&field)
                    .into_iter()
                    .map(|column| alter(&anon, AlterOperation::AddColumn(column)))
                    .collect();
                self.schema.table_mut(self.database, &stmt.table)?.create_field(field)?;

                let table = self.schema.table(self.database, &stmt.table)?;
                self.mirror.insert_field(table, table.field(&def.name)?)?;
                info!(table = %stmt.table, column = %def.name, "added column");
                Ok(DdlRewrite { live, scratch: vec![alter(&anon, AlterOperation::AddColumn(def.clone()))] })
            }
            AlterOperation::DropColumn(name) => {
                let field = table.field(name)?;
                if table.fields().len() == 1 {
                    return Err(Error::Unsupported(format!("cannot drop `{name}`, the only column of `{}`", stmt.table)));
                }
                let live = field
                    .physical_columns()
                    .into_iter()
                    .map(|(column, _)| alter(&anon, AlterOperation::DropColumn(column)))
                    .collect();

                self.schema.table_mut(self.database, &stmt.table)?.destroy_field(name)?;
                self.mirror.delete_field(self.schema.table(self.database, &stmt.table)?, name)?;
                info!(table = %stmt.table, column = %name, "dropped column");
                Ok(DdlRewrite { live, scratch: vec![alter(&anon, AlterOperation::DropColumn(name.clone()))] })
            }
        }
    }

    /// Handles `DROP TABLE`.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the table does not exist (without
    /// `IF EXISTS`), or a mirror error.
    pub fn drop_table(&mut self, stmt: &DropTable) -> Result<DdlRewrite, Error> {
        if !self.schema.has_table(self.database, &stmt.name) {
            if stmt.if_exists {
                return Ok(DdlRewrite::default());
            }
            return Err(Error::MetadataConflict(format!("no table {}.{}", self.database, stmt.name)));
        }
        let anon = self.schema.table(self.database, &stmt.name)?.anon_name().to_string();
        let live = vec![Statement::DropTable(DropTable { name: anon.clone(), if_exists: false })];

        self.schema.destroy_table(self.database, &stmt.name)?;
        self.mirror.delete_table(self.database, &stmt.name)?;
        info!(table = %stmt.name, anon = %anon, "dropped table");
        Ok(DdlRewrite { live, scratch: vec![Statement::DropTable(DropTable { name: anon, if_exists: true })] })
    }
}

impl Ddl<'_> {
    /// Removes the metadata registered by a `CREATE TABLE` or `ADD COLUMN`
    /// whose DDL failed, returning the statements that drop whatever the
    /// stores did create.
    ///
    /// Returns `None` when `stmt` registered nothing. Drops cannot be undone:
    /// their keys are already gone.
    ///
    /// # Errors
    ///
    /// Returns a mirror error.
    pub fn revert(&mut self, stmt: &Statement) -> Result<Option<DdlRewrite>, Error> {
        match stmt {
            Statement::CreateTable(create) if self.schema.has_table(self.database, &create.name) => {
                let undo = self.drop_table(&DropTable { name: create.name.clone(), if_exists: true })?;
                info!(table = %create.name, "reverted table creation");
                Ok(Some(undo))
            }
            Statement::AlterTable(AlterTable { table, operation: AlterOperation::AddColumn(def) })
                if self.schema.table(self.database, table).is_ok_and(|t| t.has_field(&def.name)) =>
            {
                let drop = AlterTable { table: table.clone(), operation: AlterOperation::DropColumn(def.name.clone()) };
                let undo = self.alter_table(&drop)?;
                info!(table = %table, column = %def.name, "reverted column addition");
                Ok(Some(undo))
            }
            _ => Ok(None),
        }
    }
}

/// Scratch-store definition of a table: logical columns under the anonymized name.
pub(crate) fn logical_table(table: &TableMetadata) -> CreateTable {
    CreateTable {
        name: table.anon_name().to_string(),
        columns: table.fields().iter().map(|f| ColumnDef::new(f.name(), f.sql_type())).collect(),
        if_not_exists: true,
    }
}

fn physical_defs(field: &FieldMetadata) -> Vec<ColumnDef> {
    field.physical_columns().into_iter().map(|(name, sql_type)| ColumnDef::new(name, sql_type)).collect()
}

fn alter(table: &str, operation: AlterOperation) -> Statement {
    Statement::AlterTable(AlterTable { table: table.to_string(), operation })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SqlType;

    struct Fixture {
        schema: SchemaMetadata,
        mirror: MetaMirror,
        master: SecretVec<u8>,
    }

    impl Fixture {
        fn new() -> Self {
            Self { schema: SchemaMetadata::new(), mirror: MetaMirror::open(None).unwrap(), master: SecretVec::new(vec![1; 32]) }
        }

        fn ddl(&mut self, enc_by_default: bool) -> Ddl<'_> {
            Ddl { schema: &mut self.schema, mirror: &mut self.mirror, master: &self.master, database: "db", enc_by_default }
        }
    }

    fn users() -> CreateTable {
        CreateTable::new("users").column("id", SqlType::Integer).column("name", SqlType::Text)
    }

    #[test]
    fn test_create_table() {
        let mut fx = Fixture::new();
        let out = fx.ddl(true).create_table(&users()).unwrap();
        let Statement::CreateTable(live) = &out.live[0] else { panic!("not a create") };
        // id: DET, ORD, HOM, salt; name: DET, ORD, SEARCH, salt
        assert_eq!(live.columns.len(), 8);
        assert!(live.columns.iter().all(|c| c.name != "id" && c.name != "name"));

        let Statement::CreateTable(scratch) = &out.scratch[0] else { panic!("not a create") };
        assert_eq!(scratch.name, live.name);
        assert_eq!(scratch.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), ["id", "name"]);

        assert!(fx.mirror.load().unwrap().has_table("db", "users"));
    }

    #[test]
    fn test_create_existing() {
        let mut fx = Fixture::new();
        fx.ddl(true).create_table(&users()).unwrap();
        assert!(fx.ddl(true).create_table(&users()).is_err());

        let mut again = users();
        again.if_not_exists = true;
        assert_eq!(fx.ddl(true).create_table(&again).unwrap(), DdlRewrite::default());
    }

    #[test]
    fn test_duplicate_column_leaves_nothing() {
        let mut fx = Fixture::new();
        let bad = CreateTable::new("t").column("a", SqlType::Integer).column("a", SqlType::Text);
        assert!(fx.ddl(true).create_table(&bad).is_err());
        assert!(!fx.schema.has_table("db", "t"));
        assert!(!fx.mirror.load().unwrap().has_table("db", "t"));
    }

    #[test]
    fn test_plain_by_default_off() {
        let mut fx = Fixture::new();
        let out = fx.ddl(false).create_table(&users()).unwrap();
        let Statement::CreateTable(live) = &out.live[0] else { panic!("not a create") };
        assert_eq!(live.columns.len(), 2);
        assert!(fx.schema.table("db", "users").unwrap().field("id").unwrap().is_plain());
    }

    #[test]
    fn test_add_and_drop_column() {
        let mut fx = Fixture::new();
        fx.ddl(true).create_table(&users()).unwrap();

        let add = AlterTable {
            table: "users".into(),
            operation: AlterOperation::AddColumn(ColumnDef::new("avatar", SqlType::Blob)),
        };
        let out = fx.ddl(true).alter_table(&add).unwrap();
        // DET and salt
        assert_eq!(out.live.len(), 2);
        assert!(fx.mirror.load().unwrap().table("db", "users").unwrap().has_field("avatar"));

        let drop = AlterTable { table: "users".into(), operation: AlterOperation::DropColumn("name".into()) };
        let out = fx.ddl(true).alter_table(&drop).unwrap();
        assert_eq!(out.live.len(), 4);
        assert!(!fx.schema.table("db", "users").unwrap().has_field("name"));
        assert!(!fx.mirror.load().unwrap().table("db", "users").unwrap().has_field("name"));
    }

    #[test]
    fn test_drop_table() {
        let mut fx = Fixture::new();
        fx.ddl(true).create_table(&users()).unwrap();
        let anon = fx.schema.table("db", "users").unwrap().anon_name().to_string();

        let out = fx.ddl(true).drop_table(&DropTable { name: "users".into(), if_exists: false }).unwrap();
        assert_eq!(out.live[0].to_string(), format!("DROP TABLE \"{anon}\""));
        assert!(!fx.schema.has_table("db", "users"));
        assert!(!fx.mirror.load().unwrap().has_table("db", "users"));

        let missing = DropTable { name: "users".into(), if_exists: true };
        assert_eq!(fx.ddl(true).drop_table(&missing).unwrap(), DdlRewrite::default());
    }

    #[test]
    fn test_revert_create_and_add() {
        let mut fx = Fixture::new();
        let create = Statement::CreateTable(users());
        fx.ddl(true).create_table(&users()).unwrap();
        let anon = fx.schema.table("db", "users").unwrap().anon_name().to_string();

        let add = AlterTable {
            table: "users".into(),
            operation: AlterOperation::AddColumn(ColumnDef::new("avatar", SqlType::Blob)),
        };
        fx.ddl(true).alter_table(&add).unwrap();
        let undo = fx.ddl(true).revert(&Statement::AlterTable(add)).unwrap().unwrap();
        assert_eq!(undo.live.len(), 2);
        assert!(!fx.schema.table("db", "users").unwrap().has_field("avatar"));
        assert!(!fx.mirror.load().unwrap().table("db", "users").unwrap().has_field("avatar"));

        let undo = fx.ddl(true).revert(&create).unwrap().unwrap();
        assert_eq!(undo.live, vec![Statement::DropTable(DropTable { name: anon, if_exists: false })]);
        assert!(!fx.schema.has_table("db", "users"));
        assert!(!fx.mirror.load().unwrap().has_table("db", "users"));

        assert_eq!(fx.ddl(true).revert(&create).unwrap(), None);
        let drop = Statement::DropTable(DropTable { name: "users".into(), if_exists: true });
        assert_eq!(fx.ddl(true).revert(&drop).unwrap(), None);
    }
}
