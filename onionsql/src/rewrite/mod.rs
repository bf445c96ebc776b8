//! Rewrite planner: gather capabilities bottom-up, choose and substitute top-down.
//!
//! [`Rewriter::gather`] walks an expression tree from the leaves, attaching to
//! every node the capability set its operands can share under the node's
//! policy. The rewrite pass then walks down again: each operator picks one
//! representation with [`EncSet::choose_one`] and rewrites its operands into
//! it. A column whose onion sits above the chosen level yields
//! [`Error::AdjustmentRequired`]; nothing is adjusted here.

mod ddl;
mod handlers;
mod policy;

use std::fmt::Write as _;

use secrecy::SecretVec;
use tracing::debug;

use crate::adjust::AdjustmentRequest;
use crate::analysis::{Analysis, RewritePlan};
use crate::capability::{EncSet, Olk};
use crate::crypto::context::LayerContext;
use crate::crypto::{hom, Layer, Onion, SecLevel, SqlType};
use crate::decrypt::{ReturnField, ReturnMeta};
use crate::error::Error;
use crate::schema::FieldMetadata;
use crate::sql::{AggregateFunc, BinaryOp, ColumnRef, Expr, SelectItem, Statement};
use crate::value::Value;

pub use ddl::{Ddl, DdlRewrite};
pub(crate) use ddl::logical_table;
pub use handlers::{rewrite_delete, rewrite_insert, rewrite_select, rewrite_update, UpdatePlan};
pub use policy::{equality, order, policy, Output, Policy};

/// Physical statements for one logical statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRewrite {
    /// Statements to run against the live store, in order
    pub statements: Vec<Statement>,
    /// How to decrypt the result of the last statement
    pub return_meta: Option<ReturnMeta>,
}

impl QueryRewrite {
    /// A rewrite that produces no result set.
    #[must_use]
    pub fn statements(statements: Vec<Statement>) -> Self {
        Self { statements, return_meta: None }
    }
}

/// Representation a node is rewritten into.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    olk: Olk,
    /// Declared type of a sibling column, for literals under a shared key
    hint: Option<SqlType>,
    /// Salt for literals under salted levels
    salt: u64,
}

impl Target {
    const fn new(olk: Olk, hint: Option<SqlType>) -> Self {
        Self { olk, hint, salt: 0 }
    }

    const fn plain() -> Self {
        Self::new(Olk::plain(), None)
    }

    pub(crate) const fn salted(olk: Olk, hint: Option<SqlType>, salt: u64) -> Self {
        Self { olk, hint, salt }
    }
}

/// Gathers and rewrites the expressions of one statement.
pub(crate) struct Rewriter<'a> {
    pub(crate) analysis: Analysis<'a>,
    master: &'a SecretVec<u8>,
}

impl<'a> Rewriter<'a> {
    pub(crate) fn new(analysis: Analysis<'a>, master: &'a SecretVec<u8>) -> Self {
        Self { analysis, master }
    }

    /// Computes and records the output capability set of `expr` and its subtree.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsatisfiableRequirement` if an operator's operands
    /// share no representation, or `Error::MetadataConflict` for an unknown column.
    pub(crate) fn gather(&mut self, expr: &Expr) -> Result<EncSet, Error> {
        let (output, operands, derivation) = match expr {
            Expr::Column(col) => {
                let (_, field) = self.analysis.resolve_column(col)?;
                let set = EncSet::for_field(field);
                let derivation = format!("column {} {set}", field.field_ref());
                (set.clone(), set, derivation)
            }
            Expr::Literal(_) => (EncSet::full(), EncSet::full(), "literal".to_string()),
            _ => {
                let policy = policy(expr).ok_or_else(|| Error::Unsupported(format!("no policy for `{expr}`")))?;
                let mut operands = policy.requirement.clone();
                let mut derivation = format!("{} requires {operands}", policy.label);
                for child in expr.children() {
                    let out = self.gather(child)?;
                    operands = operands.intersect(&out);
                    let _ = write!(derivation, "; with `{child}` {out} leaves {operands}");
                }
                if operands.is_empty() {
                    return Err(Error::unsatisfiable(expr, derivation));
                }
                let output = match policy.output {
                    Output::Plain => EncSet::plain(),
                    Output::Operands => operands.clone(),
                };
                (output, operands, derivation)
            }
        };
        self.analysis.set_plan(expr, RewritePlan { output: output.clone(), operands, derivation });
        Ok(output)
    }

    /// Gathers a `WHERE` or `HAVING` condition, which must evaluate to plaintext.
    pub(crate) fn gather_condition(&mut self, expr: &Expr) -> Result<(), Error> {
        let out = self.gather(expr)?;
        if !out.contains(Onion::Plain) {
            return Err(Error::unsatisfiable(expr, format!("condition must be plaintext but can only be {out}")));
        }
        Ok(())
    }

    /// Gathers a `GROUP BY` or `ORDER BY` key and picks its representation.
    pub(crate) fn gather_key(&mut self, expr: &Expr, requirement: &EncSet) -> Result<Olk, Error> {
        let out = self.gather(expr)?;
        let set = requirement.intersect(&out);
        set.choose_one()
            .map_err(|_| Error::unsatisfiable(expr, format!("key requires {requirement} but can only be {out}")))
    }

    /// Gathers a projected expression and picks its representation.
    pub(crate) fn gather_projection(&mut self, expr: &Expr) -> Result<Olk, Error> {
        let out = self.gather(expr)?;
        out.choose_one().map_err(|_| Error::unsatisfiable(expr, format!("cannot project any of {out}")))
    }

    /// Rewrites a condition gathered with [`Self::gather_condition`].
    pub(crate) fn rewrite_condition(&self, expr: &Expr) -> Result<Expr, Error> {
        self.rewrite_expr(expr, &Target::plain())
    }

    /// Rewrites a key or projection into a chosen representation.
    pub(crate) fn rewrite_as(&self, expr: &Expr, olk: &Olk) -> Result<Expr, Error> {
        self.rewrite_expr(expr, &Target::new(olk.clone(), self.type_hint(expr)))
    }

    /// Rewrites a projection list, adding salt columns where decryption needs them.
    pub(crate) fn rewrite_projection(
        &self,
        items: &[(&Expr, Option<&str>, Olk)],
    ) -> Result<(Vec<SelectItem>, ReturnMeta), Error> {
        let mut projection = Vec::with_capacity(items.len());
        let mut fields = Vec::with_capacity(items.len());
        for (expr, alias, olk) in items {
            let rewritten = self.rewrite_as(expr, olk)?;
            let name = alias.map_or_else(|| output_name(expr), str::to_string);
            let mut olk = olk.clone();
            let mut salt_column = None;

            if let Expr::Column(col) = expr {
                let (_, field) = self.analysis.resolve_column(col)?;
                olk.field = olk.field.or_else(|| Some(field.field_ref().clone()));
                if olk.level.needs_salt() {
                    if let Some(salt) = field.salt_name() {
                        let table = self.analysis.physical_qualifier(col)?;
                        salt_column = Some(Expr::Column(ColumnRef { table, name: salt.to_string() }));
                    }
                }
            }

            projection.push(SelectItem::Expr { expr: rewritten, alias: None });
            let salt_index = salt_column.map(|salt| {
                projection.push(SelectItem::Expr { expr: salt, alias: None });
                projection.len() - 1
            });
            fields.push(ReturnField { name: name.clone(), olk: olk.clone(), is_salt: false, salt_index });
            if salt_index.is_some() {
                fields.push(ReturnField { name: format!("{name}$salt"), olk, is_salt: true, salt_index: None });
            }
        }
        Ok((projection, ReturnMeta { fields }))
    }

    pub(crate) fn rewrite_expr(&self, expr: &Expr, target: &Target) -> Result<Expr, Error> {
        match expr {
            Expr::Column(col) => return self.rewrite_column(col, &target.olk),
            Expr::Literal(value) => return Ok(Expr::Literal(self.encrypt_literal(value, target)?)),
            _ => {}
        }

        let plan = self.analysis.plan(expr)?;
        let own = match policy(expr).map(|p| p.output) {
            Some(Output::Operands) => {
                if !plan.operands.contains(target.olk.onion) {
                    return Err(Error::unsatisfiable(
                        expr,
                        format!("{} is not among {}; {}", target.olk, plan.operands, plan.derivation),
                    ));
                }
                target.clone()
            }
            _ => {
                let olk = plan
                    .operands
                    .choose_one()
                    .map_err(|_| Error::unsatisfiable(expr, &plan.derivation))?;
                debug!(expr = %expr, olk = %olk, "chose representation");
                Target::new(olk, self.type_hint(expr))
            }
        };
        let sub = |e: &Expr| self.rewrite_expr(e, &own);

        let rewritten = match expr {
            Expr::Binary { op: BinaryOp::Plus, left, right } if own.olk.onion == Onion::Hom => {
                Expr::func("onion_hom_add", vec![sub(left)?, sub(right)?, self.hom_modulus(&own.olk)?])
            }
            Expr::Binary { op, left, right } => Expr::Binary { op: *op, left: Box::new(sub(left)?), right: Box::new(sub(right)?) },
            Expr::Not(inner) => Expr::Not(Box::new(sub(inner)?)),
            Expr::IsNull { expr: inner, negated } => Expr::IsNull { expr: Box::new(sub(inner)?), negated: *negated },
            Expr::Like { expr: inner, pattern, negated } if own.olk.onion == Onion::Search => {
                let word = policy::like_word(pattern)
                    .ok_or_else(|| Error::Unsupported(format!("`{pattern}` is not a word pattern")))?;
                let search = Expr::func("onion_search", vec![sub(inner)?, self.search_token(&own.olk, word)?]);
                if *negated {
                    search.negate()
                } else {
                    search
                }
            }
            Expr::Like { expr: inner, pattern, negated } => {
                Expr::Like { expr: Box::new(sub(inner)?), pattern: pattern.clone(), negated: *negated }
            }
            Expr::InList { expr: inner, list, negated } => Expr::InList {
                expr: Box::new(sub(inner)?),
                list: list.iter().map(sub).collect::<Result<_, _>>()?,
                negated: *negated,
            },
            Expr::Function { name, args } => {
                Expr::Function { name: name.clone(), args: args.iter().map(sub).collect::<Result<_, _>>()? }
            }
            Expr::Aggregate { func: AggregateFunc::Sum, arg: Some(arg) } if own.olk.onion == Onion::Hom => {
                Expr::func("onion_hom_sum", vec![sub(arg)?, self.hom_modulus(&own.olk)?])
            }
            Expr::Aggregate { func, arg } => Expr::Aggregate {
                func: *func,
                arg: arg.as_deref().map(sub).transpose()?.map(Box::new),
            },
            Expr::Column(_) | Expr::Literal(_) => expr.clone(),
        };
        Ok(rewritten)
    }

    fn rewrite_column(&self, col: &ColumnRef, olk: &Olk) -> Result<Expr, Error> {
        let (_, field) = self.analysis.resolve_column(col)?;
        if olk.field.as_ref().is_some_and(|bound| bound != field.field_ref()) {
            return Err(Error::unsatisfiable(col, format!("{olk} is bound to another field")));
        }
        let onion = field.onion(olk.onion)?;
        let current = onion.level();
        if current > olk.level {
            return Err(Error::AdjustmentRequired(AdjustmentRequest {
                field: field.field_ref().clone(),
                onion: olk.onion,
                target: olk.level,
            }));
        }
        if current < olk.level {
            return Err(Error::unsatisfiable(col, format!("{} is at {current}, below {olk}", field.field_ref())));
        }
        Ok(Expr::Column(ColumnRef { table: self.analysis.physical_qualifier(col)?, name: onion.anon_name().to_string() }))
    }

    fn encrypt_literal(&self, value: &Value, target: &Target) -> Result<Value, Error> {
        let olk = &target.olk;
        if olk.is_plain() || value.is_null() {
            return Ok(value.clone());
        }
        if let Some(field) = &olk.field {
            let onion = self.analysis.schema().field(field)?.onion(olk.onion)?;
            return onion.encrypt_to(value, olk.level, target.salt);
        }

        let sql_type = target.hint.or_else(|| value.sql_type()).unwrap_or(SqlType::Blob);
        olk.onion
            .chain()
            .iter()
            .filter(|level| **level != SecLevel::PlainVal && **level <= olk.level)
            .try_fold(value.clone(), |v, level| {
                let context = LayerContext::shared(olk.onion, *level);
                Layer::derive(olk.onion, *level, sql_type, self.master, &context)?.encrypt(&v, 0)
            })
    }

    fn bound_field(&self, olk: &Olk) -> Result<&'a FieldMetadata, Error> {
        let field = olk
            .field
            .as_ref()
            .ok_or_else(|| Error::Unsupported(format!("{olk} is not bound to a field")))?;
        self.analysis.schema().field(field)
    }

    fn hom_modulus(&self, olk: &Olk) -> Result<Expr, Error> {
        let layer = self
            .bound_field(olk)?
            .onion(Onion::Hom)?
            .layer_at(SecLevel::Hom)
            .ok_or_else(|| Error::Unsupported(format!("{olk} has no HOM layer")))?;
        Ok(Expr::lit(hom::to_block(layer.hom_modulus()?)))
    }

    fn search_token(&self, olk: &Olk, word: &str) -> Result<Expr, Error> {
        let layer = self
            .bound_field(olk)?
            .onion(Onion::Search)?
            .layer_at(SecLevel::Search)
            .ok_or_else(|| Error::Unsupported(format!("{olk} has no SEARCH layer")))?;
        Ok(Expr::lit(layer.search_token(word)?))
    }

    fn type_hint(&self, expr: &Expr) -> Option<SqlType> {
        let column_type = |e: &Expr| match e {
            Expr::Column(col) => self.analysis.resolve_column(col).ok().map(|(_, f)| f.sql_type()),
            _ => None,
        };
        column_type(expr).or_else(|| expr.children().into_iter().find_map(column_type))
    }
}

fn output_name(expr: &Expr) -> String {
    match expr {
        Expr::Column(col) => col.name.clone(),
        other => other.to_string(),
    }
}

/// Salt as stored in a salt column.
pub(crate) fn salt_value(salt: u64) -> Result<Value, Error> {
    i64::try_from(salt)
        .map(Value::Integer)
        .map_err(|_| Error::EncryptionFailed(format!("salt {salt} does not fit a signed integer")))
}
