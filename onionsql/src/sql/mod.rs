//! Statement tree consumed and produced by the rewriter.
//!
//! Statements are built in code (there is no parser) and rendered back to
//! SQLite SQL through `Display`.

mod ast;
mod display;

pub use ast::{
    AggregateFunc, AlterOperation, AlterTable, Assignment, BinaryOp, ColumnDef, ColumnRef, CreateTable, Delete,
    DropTable, Expr, ExprKey, Insert, OrderBy, Select, SelectItem, Statement, TableRef, Update,
};
