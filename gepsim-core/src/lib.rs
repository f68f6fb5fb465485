//! # gepsim-core
//!
//! Data model shared by the gepsim crates: the single-cell pool the generator draws from,
//! expression tables (reference cohorts and persisted synthetic profiles), and cell-type
//! fraction tables. Also hosts the delimited-table readers and a handful of numeric helpers
//! (quantiles, TPM normalisation, log transforms, distances).
//!
//! Tables are plain or gzip'd CSV/TSV files whose first column holds the row identifier.

pub mod errors;
pub mod io;
pub mod models;
pub mod utils;

pub use errors::{DataError, Result};
pub use models::{
    CellPool, CellRecord, ExpressionScale, ExpressionTable, FractionTable, FractionVector,
    ReferenceCohort,
};
