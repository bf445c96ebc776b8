//! Per-statement rewrite of `SELECT`, `INSERT`, `UPDATE` and `DELETE`.
//!
//! Every handler first gathers all of the statement's expressions, so an
//! unsatisfiable clause is reported before any adjustment is requested, and
//! only then rewrites.

use secrecy::SecretVec;
use tracing::debug;

use super::{equality, order, salt_value, QueryRewrite, Rewriter, Target};
use crate::analysis::Analysis;
use crate::capability::{EncSet, Olk};
use crate::crypto::kdf;
use crate::error::Error;
use crate::schema::{FieldMetadata, SchemaMetadata};
use crate::sql::{
    Assignment, Delete, Expr, Insert, OrderBy, Select, SelectItem, Statement, TableRef, Update,
};

/// Outcome of rewriting an `UPDATE`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePlan {
    /// Every onion of every assigned field can be written directly.
    InPlace(QueryRewrite),
    /// Some onion cannot hold the new value; the rows must be re-encrypted
    /// from plaintext.
    Refresh,
}

/// Rewrites a `SELECT`.
///
/// # Errors
///
/// Returns `Error::AdjustmentRequired` if a column must be peeled first,
/// `Error::UnsatisfiableRequirement` if a clause cannot be evaluated over
/// any representation, or `Error::MetadataConflict` for unknown names.
pub fn rewrite_select(
    schema: &SchemaMetadata,
    master: &SecretVec<u8>,
    database: &str,
    select: &Select,
) -> Result<QueryRewrite, Error> {
    let mut rw = Rewriter::new(Analysis::new(schema, database), master);
    let mut from = Vec::with_capacity(select.from.len());
    for table_ref in &select.from {
        let table = rw.analysis.add_table(&table_ref.name, table_ref.alias.as_deref())?;
        from.push(TableRef { name: table.anon_name().to_string(), alias: table_ref.alias.clone() });
    }
    let items = expand_projection(&rw, select)?;

    let mut chosen = Vec::with_capacity(items.len());
    for (expr, _) in &items {
        chosen.push(rw.gather_projection(expr)?);
    }
    if let Some(filter) = &select.filter {
        rw.gather_condition(filter)?;
    }
    let group_olks = select
        .group_by
        .iter()
        .map(|key| rw.gather_key(key, &equality()))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(having) = &select.having {
        rw.gather_condition(having)?;
    }
    let order_olks = select
        .order_by
        .iter()
        .map(|key| rw.gather_key(&key.expr, &order()))
        .collect::<Result<Vec<_>, _>>()?;

    let projected: Vec<(&Expr, Option<&str>, Olk)> =
        items.iter().zip(chosen).map(|((expr, alias), olk)| (expr, alias.as_deref(), olk)).collect();
    let (projection, return_meta) = rw.rewrite_projection(&projected)?;
    let filter = select.filter.as_ref().map(|f| rw.rewrite_condition(f)).transpose()?;
    let group_by = select
        .group_by
        .iter()
        .zip(&group_olks)
        .map(|(key, olk)| rw.rewrite_as(key, olk))
        .collect::<Result<Vec<_>, _>>()?;
    let having = select.having.as_ref().map(|h| rw.rewrite_condition(h)).transpose()?;
    let order_by = select
        .order_by
        .iter()
        .zip(&order_olks)
        .map(|(key, olk)| Ok(OrderBy { expr: rw.rewrite_as(&key.expr, olk)?, descending: key.descending }))
        .collect::<Result<Vec<_>, Error>>()?;

    let rewritten = Select { projection, from, filter, group_by, having, order_by, limit: select.limit };
    Ok(QueryRewrite { statements: vec![Statement::Select(rewritten)], return_meta: Some(return_meta) })
}

/// Projection items with `*` replaced by the columns of every table in
/// scope, qualified when more than one table is in scope.
fn expand_projection(rw: &Rewriter<'_>, select: &Select) -> Result<Vec<(Expr, Option<String>)>, Error> {
    let qualify = select.from.len() > 1;
    let mut items = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Expr { expr, alias } => items.push((expr.clone(), alias.clone())),
            SelectItem::Wildcard => {
                for (name, alias) in rw.analysis.tables() {
                    let table = rw.analysis.table(name)?;
                    for field in table.fields() {
                        let expr = if qualify {
                            Expr::qualified(alias.unwrap_or(name), field.name())
                        } else {
                            Expr::col(field.name())
                        };
                        items.push((expr, None));
                    }
                }
            }
        }
    }
    if items.is_empty() {
        return Err(Error::Unsupported("SELECT without output columns".to_string()));
    }
    Ok(items)
}

/// Rewrites an `INSERT`, encrypting every value into all of its field's
/// onions under a fresh salt per row.
///
/// # Errors
///
/// Returns `Error::Unsupported` for non-literal values or a row of the wrong
/// width, `Error::MetadataConflict` for unknown names, or an encryption error.
pub fn rewrite_insert(schema: &SchemaMetadata, database: &str, insert: &Insert) -> Result<QueryRewrite, Error> {
    let table = schema.table(database, &insert.table)?;
    let fields: Vec<&FieldMetadata> = if insert.columns.is_empty() {
        table.fields().iter().collect()
    } else {
        insert.columns.iter().map(|c| table.field(c)).collect::<Result<_, _>>()?
    };

    let columns = fields.iter().flat_map(|f| f.physical_columns()).map(|(name, _)| name).collect();
    let mut rows = Vec::with_capacity(insert.rows.len());
    for row in &insert.rows {
        if row.len() != fields.len() {
            return Err(Error::Unsupported(format!(
                "INSERT row has {} values for {} columns",
                row.len(),
                fields.len()
            )));
        }
        let mut physical = Vec::new();
        for (field, expr) in fields.iter().zip(row) {
            let Expr::Literal(value) = expr else {
                return Err(Error::Unsupported(format!("INSERT value `{expr}` is not a literal")));
            };
            let salt = field.has_salt().then(kdf::generate_salt);
            for (_, onion) in field.onions() {
                physical.push(Expr::Literal(onion.encrypt_to(value, onion.level(), salt.unwrap_or(0))?));
            }
            if let Some(salt) = salt {
                physical.push(Expr::Literal(salt_value(salt)?));
            }
        }
        rows.push(physical);
    }

    let rewritten = Insert { table: table.anon_name().to_string(), columns, rows };
    Ok(QueryRewrite::statements(vec![Statement::Insert(rewritten)]))
}

/// Rewrites a `DELETE`.
///
/// # Errors
///
/// As for [`rewrite_select`].
pub fn rewrite_delete(
    schema: &SchemaMetadata,
    master: &SecretVec<u8>,
    database: &str,
    delete: &Delete,
) -> Result<QueryRewrite, Error> {
    let mut rw = Rewriter::new(Analysis::new(schema, database), master);
    let table = rw.analysis.add_table(&delete.table, None)?;
    if let Some(filter) = &delete.filter {
        rw.gather_condition(filter)?;
    }
    let filter = delete.filter.as_ref().map(|f| rw.rewrite_condition(f)).transpose()?;
    let rewritten = Delete { table: table.anon_name().to_string(), filter };
    Ok(QueryRewrite::statements(vec![Statement::Delete(rewritten)]))
}

/// Rewrites an `UPDATE` in place, or reports that the rows need a refresh.
///
/// An assignment can be written in place only if its value survives in every
/// onion of the target field. Literal values are encrypted under a fresh
/// salt, which is written to the field's salt column; other values keep the
/// row's salt.
///
/// # Errors
///
/// As for [`rewrite_select`].
pub fn rewrite_update(
    schema: &SchemaMetadata,
    master: &SecretVec<u8>,
    database: &str,
    update: &Update,
) -> Result<UpdatePlan, Error> {
    let mut rw = Rewriter::new(Analysis::new(schema, database), master);
    let table = rw.analysis.add_table(&update.table, None)?;
    if let Some(filter) = &update.filter {
        rw.gather_condition(filter)?;
    }

    let mut targets = Vec::with_capacity(update.assignments.len());
    for assignment in &update.assignments {
        let field = table.field(&assignment.column)?;
        let kept = rw.gather(&assignment.value)?.intersect(&EncSet::for_field(field));
        if field.onions().any(|(onion, _)| !kept.contains(*onion)) {
            debug!(field = %field.field_ref(), value = %assignment.value, "update needs a refresh");
            return Ok(UpdatePlan::Refresh);
        }
        targets.push((field, kept));
    }

    let mut assignments = Vec::new();
    for (assignment, (field, kept)) in update.assignments.iter().zip(targets) {
        let salt = (matches!(assignment.value, Expr::Literal(_)) && field.has_salt())
            .then(|| rw.analysis.salt_for(field.field_ref()));
        for (onion, meta) in field.onions() {
            let range = kept
                .get(*onion)
                .ok_or_else(|| Error::unsatisfiable(&assignment.value, format!("{onion} onion dropped")))?;
            let olk = Olk { onion: *onion, level: range.ceiling, field: range.field.clone() };
            let target = Target::salted(olk, Some(field.sql_type()), salt.unwrap_or(0));
            assignments.push(Assignment {
                column: meta.anon_name().to_string(),
                value: rw.rewrite_expr(&assignment.value, &target)?,
            });
        }
        if let (Some(salt), Some(column)) = (salt, field.salt_name()) {
            assignments.push(Assignment { column: column.to_string(), value: Expr::Literal(salt_value(salt)?) });
        }
    }
    let filter = update.filter.as_ref().map(|f| rw.rewrite_condition(f)).transpose()?;

    let rewritten = Update { table: table.anon_name().to_string(), assignments, filter };
    Ok(UpdatePlan::InPlace(QueryRewrite::statements(vec![Statement::Update(rewritten)])))
}
