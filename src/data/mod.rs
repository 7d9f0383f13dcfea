//! Data layer: cell and dataset types, file I/O and row filtering.
//!
//! ```text
//!  .csv / .json / .parquet ──► loader ──► Dataset ──► filter ──► Dataset
//!                                            │
//!                                            └──► export ──► RecordBatch
//!                                                            ├─ pretty table
//!                                                            └─ .csv / .json / .parquet
//! ```
//!
//! Nothing here mutates a `Dataset`; every step hands back a new one.

pub mod export;
pub mod filter;
pub mod loader;
pub mod model;
