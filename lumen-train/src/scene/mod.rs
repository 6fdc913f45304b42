//! Scene representation: the radiance field and the dense linear algebra it runs on.

pub mod field;
pub mod linear;
pub mod matrix;

pub use field::{FieldCache, FieldConfig, FieldGradients, FieldModel};
pub use linear::{Linear, LinearGrad};
pub use matrix::Matrix;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FieldError {
    #[error("field expects {expected} input channels per row, got {actual}")]
    InputWidth { expected: usize, actual: usize },

    #[error("{rows}x{cols} matrix needs {expected} values, got {actual}")]
    Shape {
        rows: usize,
        cols: usize,
        expected: usize,
        actual: usize,
    },

    #[error("invalid field configuration: {0}")]
    InvalidConfig(String),

    #[error("checkpoint does not match its configuration: {0}")]
    Checkpoint(String),

    #[error("failed to access checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
