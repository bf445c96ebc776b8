//! Onion encryption: families, levels and the per-level layer transforms.
//!
//! Every encrypted column carries several onions. Each onion is a stack of
//! [`Layer`]s, weakest at the bottom, and the store only ever sees the
//! outermost one. Peeling the outer layer exposes a weaker level that
//! supports more SQL operators.

pub mod context;
pub mod deterministic;
pub mod hom;
pub mod kdf;
pub mod layer;
pub mod material;
pub mod ope;
pub mod random;
pub mod search;

mod onion;

pub use layer::Layer;
pub use onion::{Onion, SecLevel, SqlType};
