//! Rendering to SQLite SQL.
//!
//! Every binary, unary and predicate expression is parenthesized, so the
//! rendered text never depends on operator precedence. Table, column and
//! alias names are always double-quoted, so keywords such as `order` are
//! valid names.

use std::fmt::{self, Display, Formatter};

use super::ast::{
    AggregateFunc, AlterOperation, AlterTable, BinaryOp, ColumnRef, CreateTable, Delete, DropTable, Expr, Insert,
    OrderBy, Select, SelectItem, Statement, TableRef, Update,
};

/// A quoted identifier, with embedded quotes doubled.
struct Ident<'a>(&'a str);

impl Display for Ident<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0.replace('"', "\"\""))
    }
}

struct List<'a, T>(&'a [T]);

impl<T: Display> Display for List<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

impl Display for ColumnRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(table) = &self.table {
            write!(f, "{}.", Ident(table))?;
        }
        write!(f, "{}", Ident(&self.name))
    }
}

impl Display for BinaryOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
        })
    }
}

impl Display for AggregateFunc {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Min => "MIN",
            Self::Max => "MAX",
        })
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(col) => write!(f, "{col}"),
            Self::Literal(value) => write!(f, "{value}"),
            Self::Binary { op, left, right } => write!(f, "({left} {op} {right})"),
            Self::Not(expr) => write!(f, "(NOT {expr})"),
            Self::IsNull { expr, negated } => {
                write!(f, "({expr} IS {}NULL)", if *negated { "NOT " } else { "" })
            }
            Self::Like { expr, pattern, negated } => {
                write!(f, "({expr} {}LIKE {pattern})", if *negated { "NOT " } else { "" })
            }
            Self::InList { expr, list, negated } => {
                write!(f, "({expr} {}IN ({}))", if *negated { "NOT " } else { "" }, List(list))
            }
            Self::Function { name, args } => write!(f, "{name}({})", List(args)),
            Self::Aggregate { func, arg: None } => write!(f, "{func}(*)"),
            Self::Aggregate { func, arg: Some(arg) } => write!(f, "{func}({arg})"),
        }
    }
}

impl Display for SelectItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wildcard => f.write_str("*"),
            Self::Expr { expr, alias: None } => write!(f, "{expr}"),
            Self::Expr { expr, alias: Some(alias) } => write!(f, "{expr} AS {}", Ident(alias)),
        }
    }
}

impl Display for TableRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Ident(&self.name))?;
        if let Some(alias) = &self.alias {
            write!(f, " AS {}", Ident(alias))?;
        }
        Ok(())
    }
}

impl Display for OrderBy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        if self.descending {
            f.write_str(" DESC")?;
        }
        Ok(())
    }
}

impl Display for Select {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT {}", List(&self.projection))?;
        if !self.from.is_empty() {
            write!(f, " FROM {}", List(&self.from))?;
        }
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {filter}")?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY {}", List(&self.group_by))?;
        }
        if let Some(having) = &self.having {
            write!(f, " HAVING {having}")?;
        }
        if !self.order_by.is_empty() {
            write!(f, " ORDER BY {}", List(&self.order_by))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        Ok(())
    }
}

impl Display for Insert {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "INSERT INTO {}", Ident(&self.table))?;
        if !self.columns.is_empty() {
            let columns: Vec<Ident<'_>> = self.columns.iter().map(|c| Ident(c)).collect();
            write!(f, " ({})", List(&columns))?;
        }
        f.write_str(" VALUES ")?;
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "({})", List(row))?;
        }
        Ok(())
    }
}

impl Display for Update {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "UPDATE {} SET ", Ident(&self.table))?;
        for (i, a) in self.assignments.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} = {}", Ident(&a.column), a.value)?;
        }
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {filter}")?;
        }
        Ok(())
    }
}

impl Display for Delete {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "DELETE FROM {}", Ident(&self.table))?;
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {filter}")?;
        }
        Ok(())
    }
}

impl Display for CreateTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("CREATE TABLE ")?;
        if self.if_not_exists {
            f.write_str("IF NOT EXISTS ")?;
        }
        write!(f, "{} (", Ident(&self.name))?;
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {}", Ident(&col.name), col.sql_type)?;
        }
        f.write_str(")")
    }
}

impl Display for AlterTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.operation {
            AlterOperation::AddColumn(col) => {
                write!(f, "ALTER TABLE {} ADD COLUMN {} {}", Ident(&self.table), Ident(&col.name), col.sql_type)
            }
            AlterOperation::DropColumn(name) => {
                write!(f, "ALTER TABLE {} DROP COLUMN {}", Ident(&self.table), Ident(name))
            }
        }
    }
}

impl Display for DropTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("DROP TABLE ")?;
        if self.if_exists {
            f.write_str("IF EXISTS ")?;
        }
        write!(f, "{}", Ident(&self.name))
    }
}

impl Display for Statement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select(s) => write!(f, "{s}"),
            Self::Insert(s) => write!(f, "{s}"),
            Self::Update(s) => write!(f, "{s}"),
            Self::Delete(s) => write!(f, "{s}"),
            Self::CreateTable(s) => write!(f, "{s}"),
            Self::AlterTable(s) => write!(f, "{s}"),
            Self::DropTable(s) => write!(f, "{s}"),
            Self::Begin => f.write_str("BEGIN"),
            Self::Commit => f.write_str("COMMIT"),
            Self::Rollback => f.write_str("ROLLBACK"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SqlType;

    #[test]
    fn test_select_rendering() {
        let select = Select::new()
            .project(Expr::qualified("u", "name"))
            .project_as(Expr::aggregate(AggregateFunc::Sum, Expr::col("age")), "total")
            .from_as("users", "u")
            .filter(Expr::col("age").gt(Expr::lit(30)).and(Expr::col("name").like("%bo%")))
            .group_by(Expr::qualified("u", "name"))
            .order_by(Expr::col("total"), true)
            .limit(5);
        assert_eq!(
            select.to_string(),
            "SELECT \"u\".\"name\", SUM(\"age\") AS \"total\" FROM \"users\" AS \"u\" \
             WHERE ((\"age\" > 30) AND (\"name\" LIKE '%bo%')) GROUP BY \"u\".\"name\" \
             ORDER BY \"total\" DESC LIMIT 5"
        );
    }

    #[test]
    fn test_dml_rendering() {
        let insert = Insert::new("t", &["a", "b"]).row(vec![Expr::lit(1), Expr::lit("x")]).row(vec![
            Expr::lit(2),
            Expr::null(),
        ]);
        assert_eq!(insert.to_string(), "INSERT INTO \"t\" (\"a\", \"b\") VALUES (1, 'x'), (2, NULL)");

        let update = Update::new("t").set("a", Expr::col("a").plus(Expr::lit(1))).filter(Expr::col("b").is_null());
        assert_eq!(update.to_string(), r#"UPDATE "t" SET "a" = ("a" + 1) WHERE ("b" IS NULL)"#);

        let delete = Delete { table: "t".to_string(), filter: Some(Expr::col("a").in_list(vec![Expr::lit(1)])) };
        assert_eq!(delete.to_string(), r#"DELETE FROM "t" WHERE ("a" IN (1))"#);
    }

    #[test]
    fn test_ddl_rendering() {
        let create = CreateTable::new("t").column("a", SqlType::Integer).column("b", SqlType::Blob);
        assert_eq!(create.to_string(), r#"CREATE TABLE "t" ("a" INTEGER, "b" BLOB)"#);
        let drop = DropTable { name: "t".to_string(), if_exists: true };
        assert_eq!(Statement::from(drop).to_string(), r#"DROP TABLE IF EXISTS "t""#);
        assert_eq!(Expr::count_star().to_string(), "COUNT(*)");
    }

    #[test]
    fn test_identifiers_are_quoted() {
        let create = CreateTable::new("select").column("order", SqlType::Integer).column("a\"b", SqlType::Text);
        assert_eq!(create.to_string(), r#"CREATE TABLE "select" ("order" INTEGER, "a""b" TEXT)"#);
        let select = Select::new().project(Expr::qualified("group", "order")).from("select");
        assert_eq!(select.to_string(), r#"SELECT "group"."order" FROM "select""#);
        let alter = AlterTable {
            table: "t".to_string(),
            operation: AlterOperation::DropColumn("where".to_string()),
        };
        assert_eq!(alter.to_string(), r#"ALTER TABLE "t" DROP COLUMN "where""#);
    }
}
