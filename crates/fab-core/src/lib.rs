//! Core state of the compilation driver: the typed configuration schema,
//! manifest serialization, path resolution, file hashing, and the run
//! logger.

pub mod chip;
pub mod defaults;
pub mod error;
pub mod hash;
pub mod logging;
pub mod manifest;
pub mod paths;
pub mod schema;
pub mod value;

pub use chip::Chip;
pub use error::SchemaError;
pub use value::{CellInput, Value};
