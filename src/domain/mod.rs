//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - frequency tags and their calendar arithmetic (`Frequency`)
//! - the in-memory long-format panel (`Panel`, `Series`)
//! - catalog descriptors, forecast and error records (`DatasetDescriptor`, etc.)

pub mod frequency;
pub mod panel;
pub mod types;

pub use frequency::*;
pub use panel::*;
pub use types::*;
