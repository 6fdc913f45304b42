//! Error types for mesh extraction and export.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while building or writing meshes.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error(
        "no density values cross iso-level {level} (grid range {min}..{max}); nothing to export"
    )]
    EmptySurface { level: f32, min: f32, max: f32 },

    #[error("refusing to write a mesh with no faces")]
    EmptyMesh,

    #[error("density grid {dims:?} needs at least 2 samples along every axis")]
    GridTooSmall { dims: [usize; 3] },

    #[error("density grid {dims:?} expects {expected} values, got {actual}")]
    GridSize {
        dims: [usize; 3],
        expected: usize,
        actual: usize,
    },

    #[error("face {face} references vertex {index}, but the mesh has {count} vertices")]
    InvalidFace { face: usize, index: u32, count: usize },

    #[error("mesh has {vertices} vertices but {normals} normals")]
    NormalCount { vertices: usize, normals: usize },

    #[error("mesh has {0} vertices, more than 32-bit indices can address")]
    TooManyVertices(usize),

    #[error("glTF JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
