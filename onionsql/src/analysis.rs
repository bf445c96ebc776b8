//! Per-statement analysis session.
//!
//! An [`Analysis`] is created for every rewrite attempt and dropped at its
//! end, including before a retry after an adjustment. It resolves table
//! aliases, binds each expression node to its [`RewritePlan`], and holds the
//! salts drawn for the statement.

use std::collections::HashMap;

use crate::capability::EncSet;
use crate::error::Error;
use crate::schema::{FieldMetadata, FieldRef, SchemaMetadata, TableMetadata};
use crate::sql::{ColumnRef, Expr, ExprKey};

/// Capability bookkeeping attached to one expression node.
#[derive(Debug, Clone)]
pub struct RewritePlan {
    /// What the node can produce
    pub output: EncSet,
    /// Representations its operands can share, after applying the node's requirement
    pub operands: EncSet,
    /// How `operands` was derived, for diagnostics
    pub derivation: String,
}

#[derive(Debug)]
struct Scope {
    name: String,
    alias: Option<String>,
}

/// Mutable context for analyzing and rewriting one statement.
#[derive(Debug)]
pub struct Analysis<'a> {
    schema: &'a SchemaMetadata,
    database: String,
    scope: Vec<Scope>,
    plans: HashMap<ExprKey, RewritePlan>,
    salts: HashMap<FieldRef, u64>,
}

impl<'a> Analysis<'a> {
    /// Starts a session against `database`.
    #[must_use]
    pub fn new(schema: &'a SchemaMetadata, database: impl Into<String>) -> Self {
        Self {
            schema,
            database: database.into(),
            scope: Vec::new(),
            plans: HashMap::new(),
            salts: HashMap::new(),
        }
    }

    /// Schema the session reads.
    #[must_use]
    pub const fn schema(&self) -> &'a SchemaMetadata {
        self.schema
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Brings a table into scope, optionally under an alias.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the table does not exist or the
    /// name is already in scope.
    pub fn add_table(&mut self, name: &str, alias: Option<&str>) -> Result<&'a TableMetadata, Error> {
        let table = self.schema.table(&self.database, name)?;
        let visible = alias.unwrap_or(name);
        if self.scope.iter().any(|s| s.alias.as_deref().unwrap_or(&s.name) == visible) {
            return Err(Error::MetadataConflict(format!("`{visible}` appears twice in FROM")));
        }
        self.scope.push(Scope { name: name.to_string(), alias: alias.map(str::to_string) });
        Ok(table)
    }

    /// Looks up a table that is in scope by logical name.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if it is not.
    pub fn table(&self, name: &str) -> Result<&'a TableMetadata, Error> {
        self.schema.table(&self.database, name)
    }

    /// Tables in scope with their aliases, in `FROM` order.
    pub fn tables(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.scope.iter().map(|s| (s.name.as_str(), s.alias.as_deref()))
    }

    /// Resolves a column reference against the tables in scope.
    ///
    /// A qualifier may be an alias or a table name; an unqualified name must
    /// match exactly one table.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the column is unknown or ambiguous.
    pub fn resolve_column(&self, col: &ColumnRef) -> Result<(&'a TableMetadata, &'a FieldMetadata), Error> {
        if let Some(qualifier) = &col.table {
            let scope = self
                .scope
                .iter()
                .find(|s| s.alias.as_deref().unwrap_or(&s.name) == qualifier)
                .ok_or_else(|| Error::MetadataConflict(format!("`{qualifier}` is not in FROM")))?;
            let table = self.table(&scope.name)?;
            return Ok((table, table.field(&col.name)?));
        }

        let mut found = None;
        for scope in &self.scope {
            let table = self.table(&scope.name)?;
            if table.has_field(&col.name) {
                if found.is_some() {
                    return Err(Error::MetadataConflict(format!("column `{}` is ambiguous", col.name)));
                }
                found = Some((table, table.field(&col.name)?));
            }
        }
        found.ok_or_else(|| Error::MetadataConflict(format!("no column `{}` in scope", col.name)))
    }

    /// Physical qualifier for a column: aliases are kept, table names are anonymized.
    ///
    /// # Errors
    ///
    /// Returns `Error::MetadataConflict` if the qualifier is not in scope.
    pub fn physical_qualifier(&self, col: &ColumnRef) -> Result<Option<String>, Error> {
        let Some(qualifier) = &col.table else {
            return Ok(None);
        };
        if self.scope.iter().any(|s| s.alias.as_deref() == Some(qualifier.as_str())) {
            return Ok(Some(qualifier.clone()));
        }
        Ok(Some(self.table(qualifier)?.anon_name().to_string()))
    }

    /// Records the plan of one node.
    pub fn set_plan(&mut self, expr: &Expr, plan: RewritePlan) {
        self.plans.insert(ExprKey::of(expr), plan);
    }

    /// Plan of a node analyzed in this session.
    ///
    /// # Errors
    ///
    /// Returns `Error::Unsupported` if the node was never analyzed.
    pub fn plan(&self, expr: &Expr) -> Result<&RewritePlan, Error> {
        self.plans
            .get(&ExprKey::of(expr))
            .ok_or_else(|| Error::Unsupported(format!("expression `{expr}` was not analyzed")))
    }

    /// Salt drawn for `field` in this statement, drawn on first use.
    pub fn salt_for(&mut self, field: &FieldRef) -> u64 {
        *self.salts.entry(field.clone()).or_insert_with(crate::crypto::kdf::generate_salt)
    }
}
