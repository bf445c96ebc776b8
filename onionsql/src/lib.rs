//! # onionsql
//!
//! SQL-rewriting proxy that runs queries over onion-encrypted columns.
//!
//! Every sensitive column is stored as several onions, each a stack of
//! encryption layers with the strongest outermost. Statements are rewritten
//! to operate on ciphertext; when a query needs an operation the outer layer
//! hides (equality, ordering), the proxy peels that onion in the store first
//! and records the new level in a persisted metadata mirror.
//!
//! ## Features
//!
//! - Deterministic (AES-SIV) equality and joins
//! - Order-preserving range filters, `ORDER BY`, `MIN`/`MAX`
//! - Paillier `+` and `SUM` over ciphertext
//! - Word search for `LIKE '%word%'`
//! - Randomized outer layers, salted per row
//! - Crash-detectable onion adjustment
//!
//! ## Example
//!
//! ```rust,ignore
//! use onionsql::prelude::*;
//!
//! let master = onionsql::crypto::kdf::generate_master_key();
//! let mut proxy = Proxy::open(ProxyConfig::default(), master, SqliteBackend::in_memory()?)?;
//!
//! proxy.execute(&CreateTable::new("users").column("age", SqlType::Integer).into())?;
//! proxy.execute(&Insert::new("users", &["age"]).row(vec![Expr::lit(30)]).into())?;
//! let adults = proxy.execute(&Select::new().from("users").wildcard().filter(Expr::col("age").eq(Expr::lit(30))).into())?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod adjust;
pub mod analysis;
pub mod capability;
pub mod config;
pub mod crypto;
pub mod decrypt;
pub mod error;
pub mod key_provider;
pub mod proxy;
pub mod rewrite;
pub mod schema;
pub mod sql;
pub mod store;
pub mod value;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::adjust::AdjustmentRequest;
    pub use crate::capability::{EncSet, Olk};
    pub use crate::config::ProxyConfig;
    pub use crate::crypto::{Onion, SecLevel, SqlType};
    pub use crate::error::{Error, KeyProviderError};
    pub use crate::key_provider::{KeyProvider, StaticKeyProvider};
    pub use crate::proxy::Proxy;
    pub use crate::sql::{
        AggregateFunc, AlterOperation, AlterTable, ColumnDef, CreateTable, Delete, DropTable, Expr, Insert, Select,
        Statement, Update,
    };
    pub use crate::store::{Backend, ResultSet, SqliteBackend};
    pub use crate::value::Value;
}
