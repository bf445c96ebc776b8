//! The proxy: rewrites logical statements, adjusts onions on demand, runs the
//! result against the live store and decrypts what comes back.
//!
//! # Example
//!
//! ```rust,ignore
//! use onionsql::prelude::*;
//!
//! let master = onionsql::crypto::kdf::generate_master_key();
//! let mut proxy = Proxy::open(ProxyConfig::default(), master, SqliteBackend::in_memory()?)?;
//!
//! proxy.execute(&CreateTable::new("t").column("a", SqlType::Integer).into())?;
//! proxy.execute(&Insert::new("t", &["a"]).row(vec![Expr::lit(5)]).into())?;
//! let rows = proxy.execute(&Select::new().from("t").wildcard().filter(Expr::col("a").eq(Expr::lit(5))).into())?;
//! ```

use secrecy::SecretVec;
use tracing::{debug, info, warn};

use crate::adjust::{adjust_onion, AdjustmentRequest};
use crate::config::ProxyConfig;
use crate::crypto::SecLevel;
use crate::decrypt::decrypt_results;
use crate::error::Error;
use crate::key_provider::KeyProvider;
use crate::rewrite::{
    logical_table, rewrite_delete, rewrite_insert, rewrite_select, rewrite_update, Ddl, DdlRewrite, QueryRewrite,
    UpdatePlan,
};
use crate::schema::mirror::MetaMirror;
use crate::schema::SchemaMetadata;
use crate::sql::{Assignment, ColumnRef, Delete, Expr, Insert, Select, Statement, Update};
use crate::store::{Backend, ResultSet, SqliteBackend};

/// Result of one rewrite attempt.
enum Attempt {
    Rewritten(QueryRewrite),
    NeedsAdjustment(AdjustmentRequest),
}

/// An onion-encryption proxy in front of one live store.
pub struct Proxy<B: Backend> {
    config: ProxyConfig,
    master: SecretVec<u8>,
    schema: SchemaMetadata,
    mirror: MetaMirror,
    live: B,
    scratch: SqliteBackend,
    database: String,
}

impl<B: Backend> Proxy<B> {
    /// Opens a proxy, restoring metadata from the configured mirror.
    ///
    /// # Errors
    ///
    /// Returns `Error::InterruptedAdjustment` if the mirror holds an
    /// unfinished adjustment and the configuration refuses to continue, or a
    /// mirror or store error.
    pub fn open(config: ProxyConfig, master: SecretVec<u8>, live: B) -> Result<Self, Error> {
        let mirror = MetaMirror::open(config.metadata_path.as_deref())?;
        let pending = mirror.pending_adjustments()?;
        if let Some(first) = pending.first() {
            if config.fail_on_interrupted_adjustment {
                return Err(Error::InterruptedAdjustment { onion: first.onion.clone(), from: first.from, to: first.to });
            }
            warn!(pending = pending.len(), onion = %first.onion, "continuing past interrupted adjustments");
        }

        let schema = mirror.load()?;
        let mut scratch = SqliteBackend::in_memory()?;
        let mut tables = 0;
        for (_, database) in schema.databases() {
            for table in database.tables() {
                scratch.execute(&Statement::CreateTable(logical_table(table)).to_string())?;
                tables += 1;
            }
        }

        info!(tables, database = %config.database, "proxy opened");
        Ok(Self { database: config.database.clone(), config, master, schema, mirror, live, scratch })
    }

    /// Opens a proxy with the master key from `provider`.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyProvider` if the key cannot be loaded, or any error
    /// of [`Self::open`].
    pub fn with_key_provider(config: ProxyConfig, provider: &dyn KeyProvider, live: B) -> Result<Self, Error> {
        let master = provider.master_key()?;
        Self::open(config, master, live)
    }

    /// Switches the current database.
    pub fn use_database(&mut self, database: impl Into<String>) {
        self.database = database.into();
        debug!(database = %self.database, "switched database");
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Metadata tree.
    #[must_use]
    pub const fn schema(&self) -> &SchemaMetadata {
        &self.schema
    }

    /// Live store.
    #[must_use]
    pub const fn live(&self) -> &B {
        &self.live
    }

    /// Live store, mutably. Statements sent here bypass the proxy.
    pub fn live_mut(&mut self) -> &mut B {
        &mut self.live
    }

    /// Rewrites one statement, adjusting onions until it can be expressed.
    ///
    /// Schema statements update the metadata here, before anything runs
    /// against the live store.
    ///
    /// # Errors
    ///
    /// Returns `Error::AdjustmentLimit` if more than the configured number
    /// of adjustments would be needed, or any non-recoverable rewrite,
    /// adjustment or store error.
    pub fn rewrite(&mut self, stmt: &Statement) -> Result<QueryRewrite, Error> {
        let mut adjustments = 0;
        loop {
            match self.attempt(stmt)? {
                Attempt::Rewritten(rewrite) => return Ok(rewrite),
                Attempt::NeedsAdjustment(request) => {
                    adjustments += 1;
                    if adjustments > self.config.max_adjustments {
                        return Err(Error::AdjustmentLimit { limit: self.config.max_adjustments });
                    }
                    debug!(%request, attempt = adjustments, "statement needs an adjustment");
                    self.adjust(&request)?;
                }
            }
        }
    }

    /// Rewrites and runs one statement, returning decrypted rows.
    ///
    /// A failure inside a `BEGIN`..`COMMIT` sequence rolls the live store back.
    /// A `CREATE TABLE` or `ADD COLUMN` the live store rejects is removed from
    /// the metadata again.
    ///
    /// # Errors
    ///
    /// Any error of [`Self::rewrite`], or store and decryption errors.
    pub fn execute(&mut self, stmt: &Statement) -> Result<ResultSet, Error> {
        let rewrite = self.rewrite(stmt)?;
        let result = self.run(&rewrite);
        if matches!(result, Err(Error::Store(_) | Error::StoreFailure(_))) {
            self.revert_schema_change(stmt, true);
        }
        result
    }

    fn run(&mut self, rewrite: &QueryRewrite) -> Result<ResultSet, Error> {
        let transactional = rewrite.statements.first() == Some(&Statement::Begin) && rewrite.statements.len() > 1;

        let mut last = ResultSet::default();
        for physical in &rewrite.statements {
            match self.live.execute(&physical.to_string()) {
                Ok(rs) => last = rs,
                Err(e) => {
                    if transactional {
                        warn!(error = %e, "statement failed, rolling back");
                        if let Err(rollback) = self.live.execute(&Statement::Rollback.to_string()) {
                            warn!(error = %rollback, "rollback failed");
                        }
                    }
                    return Err(e);
                }
            }
        }

        match &rewrite.return_meta {
            Some(meta) => decrypt_results(&self.schema, meta, &last),
            None => Ok(last),
        }
    }

    /// Peels an onion down to the requested level.
    ///
    /// # Errors
    ///
    /// As for [`adjust_onion`].
    pub fn adjust(&mut self, request: &AdjustmentRequest) -> Result<SecLevel, Error> {
        adjust_onion(&mut self.schema, &mut self.mirror, &mut self.live, request)
    }

    fn attempt(&mut self, stmt: &Statement) -> Result<Attempt, Error> {
        let result = match stmt {
            Statement::Select(select) => rewrite_select(&self.schema, &self.master, &self.database, select),
            Statement::Insert(insert) => rewrite_insert(&self.schema, &self.database, insert),
            Statement::Delete(delete) => rewrite_delete(&self.schema, &self.master, &self.database, delete),
            Statement::Update(update) => match rewrite_update(&self.schema, &self.master, &self.database, update) {
                Ok(UpdatePlan::InPlace(rewrite)) => Ok(rewrite),
                Ok(UpdatePlan::Refresh) => self.refresh(update),
                Err(e) => Err(e),
            },
            Statement::CreateTable(create) => self.schema_change(stmt, |ddl| ddl.create_table(create)),
            Statement::AlterTable(alter) => self.schema_change(stmt, |ddl| ddl.alter_table(alter)),
            Statement::DropTable(drop) => self.schema_change(stmt, |ddl| ddl.drop_table(drop)),
            Statement::Begin | Statement::Commit | Statement::Rollback => {
                Ok(QueryRewrite::statements(vec![stmt.clone()]))
            }
        };
        match result {
            Ok(rewrite) => Ok(Attempt::Rewritten(rewrite)),
            Err(Error::AdjustmentRequired(request)) => Ok(Attempt::NeedsAdjustment(request)),
            Err(e) => Err(e),
        }
    }

    fn ddl(&mut self) -> Ddl<'_> {
        Ddl {
            schema: &mut self.schema,
            mirror: &mut self.mirror,
            master: &self.master,
            database: &self.database,
            enc_by_default: self.config.enc_by_default,
        }
    }

    /// Applies a schema change to the metadata and the scratch store,
    /// returning the live statements.
    fn schema_change(
        &mut self,
        stmt: &Statement,
        change: impl FnOnce(&mut Ddl<'_>) -> Result<DdlRewrite, Error>,
    ) -> Result<QueryRewrite, Error> {
        let out = change(&mut self.ddl())?;
        for scratch in &out.scratch {
            if let Err(e) = self.scratch.execute(&scratch.to_string()) {
                warn!(error = %e, statement = %stmt.kind(), "scratch store rejected schema change");
                self.revert_schema_change(stmt, false);
                return Err(e);
            }
        }
        Ok(QueryRewrite::statements(out.live))
    }

    /// Drops the metadata a failed `CREATE TABLE` or `ADD COLUMN` registered,
    /// then whatever the scratch store, and the live store if it ran, created.
    fn revert_schema_change(&mut self, stmt: &Statement, live_ran: bool) {
        let undo = match self.ddl().revert(stmt) {
            Ok(Some(undo)) => undo,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "could not revert schema metadata");
                return;
            }
        };
        for scratch in &undo.scratch {
            if let Err(e) = self.scratch.execute(&scratch.to_string()) {
                debug!(error = %e, "scratch cleanup skipped");
            }
        }
        if live_ran {
            for live in &undo.live {
                if let Err(e) = self.live.execute(&live.to_string()) {
                    debug!(error = %e, "live cleanup skipped");
                }
            }
        }
    }

    /// Rewrites an `UPDATE` that cannot be applied in place.
    ///
    /// The affected rows are read back in plaintext, updated in the scratch
    /// store, and written to the live store as a delete and re-insert inside
    /// one transaction. Adjustments the read needs count against the
    /// statement's own budget.
    fn refresh(&mut self, update: &Update) -> Result<QueryRewrite, Error> {
        let table = self.schema.table(&self.database, &update.table)?;
        let anon = table.anon_name().to_string();
        let columns: Vec<String> = table.fields().iter().map(|f| f.name().to_string()).collect();

        let delete = Delete { table: update.table.clone(), filter: update.filter.clone() };
        let delete = rewrite_delete(&self.schema, &self.master, &self.database, &delete)?;

        let mut select = Select::new().from(update.table.clone()).wildcard();
        select.filter.clone_from(&update.filter);
        let read = rewrite_select(&self.schema, &self.master, &self.database, &select)?;
        let loaded = self.run(&read)?;
        info!(table = %update.table, rows = loaded.len(), "refreshing rows");

        let mut statements = vec![Statement::Begin];
        statements.extend(delete.statements);
        if !loaded.is_empty() {
            let updated = self.update_in_scratch(&anon, &columns, update, loaded)?;
            let insert = Insert { table: update.table.clone(), columns, rows: literal_rows(updated) };
            statements.extend(rewrite_insert(&self.schema, &self.database, &insert)?.statements);
        }
        statements.push(Statement::Commit);
        Ok(QueryRewrite::statements(statements))
    }

    fn update_in_scratch(
        &mut self,
        anon: &str,
        columns: &[String],
        update: &Update,
        loaded: ResultSet,
    ) -> Result<ResultSet, Error> {
        let expected = loaded.len();
        let clear = Statement::Delete(Delete { table: anon.to_string(), filter: None });
        self.scratch.execute(&clear.to_string())?;

        let load = Insert { table: anon.to_string(), columns: columns.to_vec(), rows: literal_rows(loaded) };
        self.scratch.execute(&load.to_string())?;
        let local = Update {
            table: anon.to_string(),
            assignments: update
                .assignments
                .iter()
                .map(|a| Assignment { column: a.column.clone(), value: unqualified(&a.value) })
                .collect(),
            filter: None,
        };
        let applied = self.scratch.execute(&local.to_string());

        let mut read = Select::new().from(anon.to_string());
        for column in columns {
            read = read.project(Expr::col(column.clone()));
        }
        let updated = applied.and_then(|_| self.scratch.execute(&read.to_string()));
        self.scratch.execute(&clear.to_string())?;
        let updated = updated?;

        if updated.len() != expected {
            return Err(Error::StoreFailure(format!(
                "scratch update of `{}` returned {} rows, loaded {expected}",
                update.table,
                updated.len()
            )));
        }
        Ok(updated)
    }
}

fn literal_rows(rs: ResultSet) -> Vec<Vec<Expr>> {
    rs.rows.into_iter().map(|row| row.into_iter().map(Expr::Literal).collect()).collect()
}

/// Copy of `expr` with table qualifiers removed from every column.
fn unqualified(expr: &Expr) -> Expr {
    let boxed = |e: &Expr| Box::new(unqualified(e));
    match expr {
        Expr::Column(col) => Expr::Column(ColumnRef::new(col.name.clone())),
        Expr::Literal(_) => expr.clone(),
        Expr::Binary { op, left, right } => Expr::Binary { op: *op, left: boxed(left), right: boxed(right) },
        Expr::Not(inner) => Expr::Not(boxed(inner)),
        Expr::IsNull { expr: inner, negated } => Expr::IsNull { expr: boxed(inner), negated: *negated },
        Expr::Like { expr: inner, pattern, negated } => {
            Expr::Like { expr: boxed(inner), pattern: boxed(pattern), negated: *negated }
        }
        Expr::InList { expr: inner, list, negated } => {
            Expr::InList { expr: boxed(inner), list: list.iter().map(unqualified).collect(), negated: *negated }
        }
        Expr::Function { name, args } => Expr::Function { name: name.clone(), args: args.iter().map(unqualified).collect() },
        Expr::Aggregate { func, arg } => Expr::Aggregate { func: *func, arg: arg.as_deref().map(boxed) },
    }
}
