//! Storage seam: the live database and the scratch copy the proxy talks to.
//!
//! The proxy only ever hands a backend rendered SQL text. Every value the
//! live store sees in an encrypted column is the outermost layer of one of
//! its onions; comparison and arithmetic on ciphertext go through the
//! functions [`SqliteBackend`] registers.

mod sqlite;

use crate::error::Error;
use crate::value::Value;

pub use sqlite::SqliteBackend;

/// Rows returned by a statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    /// Column names, in result order
    pub columns: Vec<String>,
    /// Row values, one entry per column
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// Result with the given columns and no rows.
    #[must_use]
    pub const fn new(columns: Vec<String>) -> Self {
        Self { columns, rows: Vec::new() }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by name.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// A database the proxy can send SQL to.
pub trait Backend {
    /// Executes one statement.
    ///
    /// Statements that produce no columns return an empty [`ResultSet`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the database rejects the statement.
    fn execute(&mut self, sql: &str) -> Result<ResultSet, Error>;
}
