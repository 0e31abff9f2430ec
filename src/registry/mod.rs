//! Declarative catalogs of datasets and models.

pub mod datasets;
pub mod models;

pub use datasets::{DATASET_PREFIX, DatasetRegistry};
pub use models::{ModelDescriptor, ModelRegistry, ModelSpec};
