//! Operator policy: what each expression kind needs from its operands.
//!
//! Built as one exhaustive match over the node kinds, so every kind the
//! statement tree can hold has exactly one entry.

use crate::capability::EncSet;
use crate::crypto::search::pattern_word;
use crate::crypto::{Onion, SecLevel};
use crate::sql::{AggregateFunc, BinaryOp, Expr};
use crate::value::Value;

/// What an operator node itself produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// A plaintext value (a boolean, a count, a scalar function result)
    Plain,
    /// Whatever representation its operands were rewritten to
    Operands,
}

/// Requirement and output of one operator node.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Representations the operands may take
    pub requirement: EncSet,
    /// What the node produces
    pub output: Output,
    /// Short name used in derivations
    pub label: &'static str,
}

impl Policy {
    fn plain(label: &'static str) -> Self {
        Self { requirement: EncSet::plain(), output: Output::Plain, label }
    }
}

/// Requirement for comparing values for equality, also used by `GROUP BY`.
#[must_use]
pub fn equality() -> EncSet {
    EncSet::plain()
        .with(Onion::Det, SecLevel::DetJoin, SecLevel::Det)
        .with(Onion::Ord, SecLevel::OpeJoin, SecLevel::Ope)
}

/// Requirement for ordering values, also used by `ORDER BY`.
#[must_use]
pub fn order() -> EncSet {
    EncSet::plain().with(Onion::Ord, SecLevel::Ope, SecLevel::Ope)
}

fn addition() -> EncSet {
    EncSet::plain().with(Onion::Hom, SecLevel::Hom, SecLevel::Hom)
}

/// Policy for an operator node. Leaves have none.
#[must_use]
pub fn policy(expr: &Expr) -> Option<Policy> {
    let policy = match expr {
        Expr::Column(_) | Expr::Literal(_) => return None,
        Expr::Binary { op, .. } => match op {
            BinaryOp::Eq | BinaryOp::NotEq => Policy { requirement: equality(), output: Output::Plain, label: "equality" },
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                Policy { requirement: order(), output: Output::Plain, label: "order" }
            }
            BinaryOp::Plus => Policy { requirement: addition(), output: Output::Operands, label: "addition" },
            BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Divide => Policy::plain("arithmetic"),
            BinaryOp::And | BinaryOp::Or => Policy::plain("boolean"),
        },
        Expr::Not(_) => Policy::plain("boolean"),
        Expr::InList { .. } => Policy { requirement: equality(), output: Output::Plain, label: "IN" },
        Expr::Like { pattern, .. } => {
            if like_word(pattern).is_some() {
                Policy {
                    requirement: EncSet::plain().with(Onion::Search, SecLevel::Search, SecLevel::Search),
                    output: Output::Plain,
                    label: "word search",
                }
            } else {
                Policy::plain("pattern match")
            }
        }
        Expr::IsNull { .. } => Policy { requirement: EncSet::full(), output: Output::Plain, label: "IS NULL" },
        Expr::Function { .. } => Policy::plain("function"),
        Expr::Aggregate { func, .. } => match func {
            AggregateFunc::Count => Policy { requirement: EncSet::full(), output: Output::Plain, label: "COUNT" },
            AggregateFunc::Sum => Policy { requirement: addition(), output: Output::Operands, label: "SUM" },
            AggregateFunc::Min | AggregateFunc::Max => {
                Policy { requirement: order(), output: Output::Operands, label: "MIN/MAX" }
            }
        },
    };
    Some(policy)
}

/// The single word of a `'%word%'` pattern literal.
#[must_use]
pub fn like_word(pattern: &Expr) -> Option<&str> {
    match pattern {
        Expr::Literal(Value::Text(p)) => pattern_word(p),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparisons() {
        let eq = policy(&Expr::col("a").eq(Expr::lit(1))).unwrap();
        assert_eq!(eq.output, Output::Plain);
        assert!(eq.requirement.contains(Onion::Det));
        assert!(!eq.requirement.contains(Onion::Hom));

        let gt = policy(&Expr::col("a").gt(Expr::lit(1))).unwrap();
        assert_eq!(gt.requirement.get(Onion::Ord).unwrap().floor, SecLevel::Ope);
        assert!(!gt.requirement.contains(Onion::Det));
    }

    #[test]
    fn test_like_word_selects_search() {
        let p = policy(&Expr::col("a").like("%apple%")).unwrap();
        assert!(p.requirement.contains(Onion::Search));
        let p = policy(&Expr::col("a").like("app%")).unwrap();
        assert!(!p.requirement.contains(Onion::Search));
        assert!(p.requirement.contains(Onion::Plain));
    }

    #[test]
    fn test_aggregates() {
        let sum = policy(&Expr::aggregate(AggregateFunc::Sum, Expr::col("a"))).unwrap();
        assert_eq!(sum.output, Output::Operands);
        assert!(sum.requirement.contains(Onion::Hom));
        let count = policy(&Expr::count_star()).unwrap();
        assert_eq!(count.requirement, EncSet::full());
        assert!(policy(&Expr::col("a")).is_none());
    }
}
