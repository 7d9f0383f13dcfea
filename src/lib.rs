//! Tabular reconciliation, aggregation and geo-join engine.
//!
//! A dataset is loaded once ([`data::loader`]), its mixed-type columns are
//! detected and coerced to declared types ([`engine::reconcile`]), gaps are
//! imputed ([`engine::impute`]), and the result is either pivoted
//! ([`engine::pivot`]) or aggregated per zip code and joined to a reference
//! table of coordinates ([`engine::geo`]). Every step returns a new
//! [`Dataset`]; [`state::Session`] is the thin holder a front-end keeps
//! between calls.

pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod state;

pub use config::EngineConfig;
pub use data::model::{Column, ColumnTypeSpec, Dataset, DeclaredType, Value, ValueKind};
pub use error::EngineError;
