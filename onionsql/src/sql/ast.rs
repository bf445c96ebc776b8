//! Owned statement tree.

use crate::crypto::SqlType;
use crate::value::Value;

/// A column reference, optionally qualified by a table name or alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    /// Qualifier
    pub table: Option<String>,
    /// Column name
    pub name: String,
}

impl ColumnRef {
    /// Creates an unqualified reference.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { table: None, name: name.into() }
    }

    /// Creates a qualified reference.
    #[must_use]
    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self { table: Some(table.into()), name: name.into() }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `AND`
    And,
    /// `OR`
    Or,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Multiply,
    /// `/`
    Divide,
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    /// `COUNT`
    Count,
    /// `SUM`
    Sum,
    /// `MIN`
    Min,
    /// `MAX`
    Max,
}

/// A SQL expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A column reference.
    Column(ColumnRef),
    /// A literal value.
    Literal(Value),
    /// A binary operation.
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        left: Box<Expr>,
        /// Right operand
        right: Box<Expr>,
    },
    /// `NOT expr`
    Not(Box<Expr>),
    /// `expr IS [NOT] NULL`
    IsNull {
        /// Tested expression
        expr: Box<Expr>,
        /// `IS NOT NULL`
        negated: bool,
    },
    /// `expr [NOT] LIKE pattern`
    Like {
        /// Tested expression
        expr: Box<Expr>,
        /// Pattern
        pattern: Box<Expr>,
        /// `NOT LIKE`
        negated: bool,
    },
    /// `expr [NOT] IN (list)`
    InList {
        /// Tested expression
        expr: Box<Expr>,
        /// Candidate values
        list: Vec<Expr>,
        /// `NOT IN`
        negated: bool,
    },
    /// A scalar function call.
    Function {
        /// Function name
        name: String,
        /// Arguments
        args: Vec<Expr>,
    },
    /// An aggregate call; `COUNT(*)` has no argument.
    Aggregate {
        /// Aggregate
        func: AggregateFunc,
        /// Argument
        arg: Option<Box<Expr>>,
    },
}

/// Identity of an expression node within one statement.
///
/// Two keys are equal iff they name the same node, not merely equal subtrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprKey(usize);

impl ExprKey {
    /// Key of `expr`, valid while the statement it belongs to is not moved.
    #[must_use]
    pub fn of(expr: &Expr) -> Self {
        Self(std::ptr::from_ref(expr) as usize)
    }
}

impl Expr {
    /// Unqualified column.
    #[must_use]
    pub fn col(name: impl Into<String>) -> Self {
        Self::Column(ColumnRef::new(name))
    }

    /// Qualified column.
    #[must_use]
    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Column(ColumnRef::qualified(table, name))
    }

    /// Literal.
    #[must_use]
    pub fn lit(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// `NULL` literal.
    #[must_use]
    pub const fn null() -> Self {
        Self::Literal(Value::Null)
    }

    /// Binary operation.
    #[must_use]
    pub fn binary(self, op: BinaryOp, other: Self) -> Self {
        Self::Binary { op, left: Box::new(self), right: Box::new(other) }
    }

    /// `self = other`
    #[must_use]
    pub fn eq(self, other: Self) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    /// `self <> other`
    #[must_use]
    pub fn not_eq(self, other: Self) -> Self {
        self.binary(BinaryOp::NotEq, other)
    }

    /// `self < other`
    #[must_use]
    pub fn lt(self, other: Self) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    /// `self > other`
    #[must_use]
    pub fn gt(self, other: Self) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    /// `self >= other`
    #[must_use]
    pub fn gt_eq(self, other: Self) -> Self {
        self.binary(BinaryOp::GtEq, other)
    }

    /// `self AND other`
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        self.binary(BinaryOp::And, other)
    }

    /// `self OR other`
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    /// `self + other`
    #[must_use]
    pub fn plus(self, other: Self) -> Self {
        self.binary(BinaryOp::Plus, other)
    }

    /// `self * other`
    #[must_use]
    pub fn times(self, other: Self) -> Self {
        self.binary(BinaryOp::Multiply, other)
    }

    /// `NOT self`
    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// `self IS NULL`
    #[must_use]
    pub fn is_null(self) -> Self {
        Self::IsNull { expr: Box::new(self), negated: false }
    }

    /// `self LIKE pattern`
    #[must_use]
    pub fn like(self, pattern: impl Into<String>) -> Self {
        let pattern = Self::Literal(Value::Text(pattern.into()));
        Self::Like { expr: Box::new(self), pattern: Box::new(pattern), negated: false }
    }

    /// `self IN (list)`
    #[must_use]
    pub fn in_list(self, list: Vec<Self>) -> Self {
        Self::InList { expr: Box::new(self), list, negated: false }
    }

    /// Scalar function call.
    #[must_use]
    pub fn func(name: impl Into<String>, args: Vec<Self>) -> Self {
        Self::Function { name: name.into(), args }
    }

    /// `COUNT(*)`
    #[must_use]
    pub const fn count_star() -> Self {
        Self::Aggregate { func: AggregateFunc::Count, arg: None }
    }

    /// Aggregate over an argument.
    #[must_use]
    pub fn aggregate(func: AggregateFunc, arg: Self) -> Self {
        Self::Aggregate { func, arg: Some(Box::new(arg)) }
    }

    /// Direct children, left to right.
    #[must_use]
    pub fn children(&self) -> Vec<&Self> {
        match self {
            Self::Column(_) | Self::Literal(_) => Vec::new(),
            Self::Binary { left, right, .. } => vec![&**left, &**right],
            Self::Not(expr) | Self::IsNull { expr, .. } => vec![&**expr],
            Self::Like { expr, pattern, .. } => vec![&**expr, &**pattern],
            Self::InList { expr, list, .. } => std::iter::once(&**expr).chain(list).collect(),
            Self::Function { args, .. } => args.iter().collect(),
            Self::Aggregate { arg, .. } => arg.iter().map(|a| &**a).collect(),
        }
    }

    /// Returns `true` for leaf nodes.
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Column(_) | Self::Literal(_))
    }
}

/// One projected item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    /// `expr [AS alias]`
    Expr {
        /// Projected expression
        expr: Expr,
        /// Output name
        alias: Option<String>,
    },
}

/// A table in `FROM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Table name
    pub name: String,
    /// Alias
    pub alias: Option<String>,
}

/// One `ORDER BY` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// Sort key
    pub expr: Expr,
    /// `DESC`
    pub descending: bool,
}

/// `SELECT`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Select {
    /// Projection
    pub projection: Vec<SelectItem>,
    /// `FROM` tables, comma-joined
    pub from: Vec<TableRef>,
    /// `WHERE`
    pub filter: Option<Expr>,
    /// `GROUP BY`
    pub group_by: Vec<Expr>,
    /// `HAVING`
    pub having: Option<Expr>,
    /// `ORDER BY`
    pub order_by: Vec<OrderBy>,
    /// `LIMIT`
    pub limit: Option<u64>,
}

impl Select {
    /// Empty select.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table to `FROM`.
    #[must_use]
    pub fn from(mut self, name: impl Into<String>) -> Self {
        self.from.push(TableRef { name: name.into(), alias: None });
        self
    }

    /// Adds an aliased table to `FROM`.
    #[must_use]
    pub fn from_as(mut self, name: impl Into<String>, alias: impl Into<String>) -> Self {
        self.from.push(TableRef { name: name.into(), alias: Some(alias.into()) });
        self
    }

    /// Projects `*`.
    #[must_use]
    pub fn wildcard(mut self) -> Self {
        self.projection.push(SelectItem::Wildcard);
        self
    }

    /// Projects an expression.
    #[must_use]
    pub fn project(mut self, expr: Expr) -> Self {
        self.projection.push(SelectItem::Expr { expr, alias: None });
        self
    }

    /// Projects an expression under an output name.
    #[must_use]
    pub fn project_as(mut self, expr: Expr, alias: impl Into<String>) -> Self {
        self.projection.push(SelectItem::Expr { expr, alias: Some(alias.into()) });
        self
    }

    /// Sets `WHERE`.
    #[must_use]
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(expr);
        self
    }

    /// Adds a `GROUP BY` key.
    #[must_use]
    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    /// Sets `HAVING`.
    #[must_use]
    pub fn having(mut self, expr: Expr) -> Self {
        self.having = Some(expr);
        self
    }

    /// Adds an `ORDER BY` key.
    #[must_use]
    pub fn order_by(mut self, expr: Expr, descending: bool) -> Self {
        self.order_by.push(OrderBy { expr, descending });
        self
    }

    /// Sets `LIMIT`.
    #[must_use]
    pub const fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// `INSERT INTO table (columns) VALUES rows`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insert {
    /// Target table
    pub table: String,
    /// Column list; empty means every column in table order
    pub columns: Vec<String>,
    /// Value rows
    pub rows: Vec<Vec<Expr>>,
}

impl Insert {
    /// Insert with an explicit column list.
    #[must_use]
    pub fn new(table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            table: table.into(),
            columns: columns.iter().map(ToString::to_string).collect(),
            rows: Vec::new(),
        }
    }

    /// Adds a row of values.
    #[must_use]
    pub fn row(mut self, values: Vec<Expr>) -> Self {
        self.rows.push(values);
        self
    }
}

/// `column = value` in `UPDATE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Assigned column
    pub column: String,
    /// New value
    pub value: Expr,
}

/// `UPDATE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    /// Target table
    pub table: String,
    /// `SET` list
    pub assignments: Vec<Assignment>,
    /// `WHERE`
    pub filter: Option<Expr>,
}

impl Update {
    /// Update with no assignments.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into(), assignments: Vec::new(), filter: None }
    }

    /// Adds `column = value`.
    #[must_use]
    pub fn set(mut self, column: impl Into<String>, value: Expr) -> Self {
        self.assignments.push(Assignment { column: column.into(), value });
        self
    }

    /// Sets `WHERE`.
    #[must_use]
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(expr);
        self
    }
}

/// `DELETE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    /// Target table
    pub table: String,
    /// `WHERE`
    pub filter: Option<Expr>,
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Declared type
    pub sql_type: SqlType,
}

impl ColumnDef {
    /// Creates a column definition.
    #[must_use]
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self { name: name.into(), sql_type }
    }
}

/// `CREATE TABLE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTable {
    /// Table name
    pub name: String,
    /// Columns
    pub columns: Vec<ColumnDef>,
    /// `IF NOT EXISTS`
    pub if_not_exists: bool,
}

impl CreateTable {
    /// Table with no columns.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), columns: Vec::new(), if_not_exists: false }
    }

    /// Adds a column.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        self.columns.push(ColumnDef::new(name, sql_type));
        self
    }
}

/// `ALTER TABLE` operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlterOperation {
    /// `ADD COLUMN`
    AddColumn(ColumnDef),
    /// `DROP COLUMN`
    DropColumn(String),
}

/// `ALTER TABLE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterTable {
    /// Target table
    pub table: String,
    /// Operation
    pub operation: AlterOperation,
}

/// `DROP TABLE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropTable {
    /// Table name
    pub name: String,
    /// `IF EXISTS`
    pub if_exists: bool,
}

/// A statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `SELECT`
    Select(Select),
    /// `INSERT`
    Insert(Insert),
    /// `UPDATE`
    Update(Update),
    /// `DELETE`
    Delete(Delete),
    /// `CREATE TABLE`
    CreateTable(CreateTable),
    /// `ALTER TABLE`
    AlterTable(AlterTable),
    /// `DROP TABLE`
    DropTable(DropTable),
    /// `BEGIN`
    Begin,
    /// `COMMIT`
    Commit,
    /// `ROLLBACK`
    Rollback,
}

impl Statement {
    /// Kind tag used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Select(_) => "SELECT",
            Self::Insert(_) => "INSERT",
            Self::Update(_) => "UPDATE",
            Self::Delete(_) => "DELETE",
            Self::CreateTable(_) => "CREATE TABLE",
            Self::AlterTable(_) => "ALTER TABLE",
            Self::DropTable(_) => "DROP TABLE",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
        }
    }
}

impl From<Select> for Statement {
    fn from(s: Select) -> Self {
        Self::Select(s)
    }
}

impl From<Insert> for Statement {
    fn from(s: Insert) -> Self {
        Self::Insert(s)
    }
}

impl From<Update> for Statement {
    fn from(s: Update) -> Self {
        Self::Update(s)
    }
}

impl From<Delete> for Statement {
    fn from(s: Delete) -> Self {
        Self::Delete(s)
    }
}

impl From<CreateTable> for Statement {
    fn from(s: CreateTable) -> Self {
        Self::CreateTable(s)
    }
}

impl From<AlterTable> for Statement {
    fn from(s: AlterTable) -> Self {
        Self::AlterTable(s)
    }
}

impl From<DropTable> for Statement {
    fn from(s: DropTable) -> Self {
        Self::DropTable(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_in_order() {
        let e = Expr::col("a").in_list(vec![Expr::lit(1), Expr::lit(2)]);
        let kids = e.children();
        assert_eq!(kids.len(), 3);
        assert_eq!(kids[0], &Expr::col("a"));
        assert!(Expr::count_star().children().is_empty());
    }

    #[test]
    fn test_expr_key_is_node_identity() {
        let e = Expr::col("a").eq(Expr::col("a"));
        let kids = e.children();
        assert_eq!(kids[0], kids[1]);
        assert_ne!(ExprKey::of(kids[0]), ExprKey::of(kids[1]));
        assert_eq!(ExprKey::of(kids[0]), ExprKey::of(kids[0]));
    }
}
