//! `rusqlite` backend with the ciphertext functions registered.
//!
//! | function | arguments | result |
//! |---|---|---|
//! | `onion_peel` | value, salt, serialized layer | value with that layer removed |
//! | `onion_search` | `Search` blob, word token | whether the word occurs |
//! | `onion_hom_add` | two `Hom` blobs, modulus | `Hom` blob of the sum |
//! | `onion_hom_sum` (aggregate) | `Hom` blob, modulus | `Hom` blob of the sum |

use std::path::Path;

use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Connection;
use tracing::trace;

use super::{Backend, ResultSet};
use crate::crypto::hom::{self, HomCiphertext};
use crate::crypto::search::contains_token;
use crate::crypto::Layer;
use crate::error::Error;
use crate::value::Value;

/// A SQLite database.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if SQLite cannot be initialized.
    pub fn in_memory() -> Result<Self, Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// Opens (or creates) a database file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::with_connection(Connection::open(path)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, Error> {
        register_functions(&conn)?;
        Ok(Self { conn })
    }

    /// Borrows the underlying connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Backend for SqliteBackend {
    fn execute(&mut self, sql: &str) -> Result<ResultSet, Error> {
        trace!(sql, "execute");
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        if columns.is_empty() {
            stmt.execute([])?;
            return Ok(ResultSet::new(columns));
        }

        let width = columns.len();
        let rows = stmt
            .query_map([], |row| (0..width).map(|i| row.get::<_, Value>(i)).collect::<rusqlite::Result<Vec<_>>>())?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResultSet { columns, rows })
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::from(rusqlite::types::Null),
            Self::Integer(v) => ToSqlOutput::from(*v),
            Self::Text(s) => ToSqlOutput::from(s.as_str()),
            Self::Blob(b) => ToSqlOutput::from(b.as_slice()),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(v) => Self::Integer(v),
            ValueRef::Real(v) => Self::Text(v.to_string()),
            ValueRef::Text(bytes) => {
                Self::Text(String::from_utf8(bytes.to_vec()).map_err(|e| FromSqlError::Other(Box::new(e)))?)
            }
            ValueRef::Blob(bytes) => Self::Blob(bytes.to_vec()),
        })
    }
}

fn user_error(err: Error) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(err))
}

fn blob_arg(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<Option<Vec<u8>>> {
    match ctx.get::<Value>(idx)? {
        Value::Null => Ok(None),
        Value::Blob(bytes) => Ok(Some(bytes)),
        other => Err(user_error(Error::DecryptionFailed(format!(
            "argument {idx} must be a blob, got {}",
            other.kind()
        )))),
    }
}

fn modulus_arg(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<u128> {
    let bytes = blob_arg(ctx, idx)?
        .ok_or_else(|| user_error(Error::DecryptionFailed("homomorphic modulus is NULL".to_string())))?;
    hom::from_block(&bytes).map_err(user_error)
}

fn hom_arg(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<Option<HomCiphertext>> {
    blob_arg(ctx, idx)?.map(|bytes| HomCiphertext::from_bytes(&bytes).map_err(user_error)).transpose()
}

fn peel(ctx: &Context<'_>) -> rusqlite::Result<Value> {
    let value = ctx.get::<Value>(0)?;
    if value.is_null() {
        return Ok(Value::Null);
    }
    let material = blob_arg(ctx, 2)?
        .ok_or_else(|| user_error(Error::InvalidKeyMaterial("layer material is NULL".to_string())))?;
    let layer = Layer::from_bytes(&material).map_err(user_error)?;
    let salt = match ctx.get::<Option<i64>>(1)? {
        Some(salt) => u64::try_from(salt).map_err(|_| user_error(Error::DecryptionFailed("negative salt".into())))?,
        None if layer.level().needs_salt() => {
            return Err(user_error(Error::MissingSalt { column: layer.level().to_string() }));
        }
        None => 0,
    };
    layer.decrypt(&value, salt).map_err(user_error)
}

fn search(ctx: &Context<'_>) -> rusqlite::Result<Option<bool>> {
    let Some(haystack) = blob_arg(ctx, 0)? else {
        return Ok(None);
    };
    let token = blob_arg(ctx, 1)?.unwrap_or_default();
    Ok(Some(contains_token(&haystack, &token)))
}

fn hom_add(ctx: &Context<'_>) -> rusqlite::Result<Value> {
    let n = modulus_arg(ctx, 2)?;
    match (hom_arg(ctx, 0)?, hom_arg(ctx, 1)?) {
        (Some(a), Some(b)) => Ok(Value::Blob(a.add(&b, n).to_bytes())),
        _ => Ok(Value::Null),
    }
}

/// `onion_hom_sum`: the product of ciphertexts modulo `n^2`.
struct HomSum;

impl Aggregate<Option<HomCiphertext>, Value> for HomSum {
    fn init(&self, _: &mut Context<'_>) -> rusqlite::Result<Option<HomCiphertext>> {
        Ok(None)
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut Option<HomCiphertext>) -> rusqlite::Result<()> {
        let Some(c) = hom_arg(ctx, 0)? else {
            return Ok(());
        };
        let n = modulus_arg(ctx, 1)?;
        *acc = Some(acc.map_or(c, |sum| sum.add(&c, n)));
        Ok(())
    }

    fn finalize(&self, _: &mut Context<'_>, acc: Option<Option<HomCiphertext>>) -> rusqlite::Result<Value> {
        Ok(acc.flatten().map_or(Value::Null, |sum| Value::Blob(sum.to_bytes())))
    }
}

fn register_functions(conn: &Connection) -> Result<(), Error> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function("onion_peel", 3, flags, peel)?;
    conn.create_scalar_function("onion_search", 2, flags, search)?;
    conn.create_scalar_function("onion_hom_add", 3, flags, hom_add)?;
    conn.create_aggregate_function("onion_hom_sum", 2, flags, HomSum)?;
    Ok(())
}
