//! Input/output helpers.
//!
//! - parquet panel loading (`panel`)
//! - result record read/write (`results`)

pub mod panel;
pub mod results;

pub use panel::*;
pub use results::*;
