//! Lumen Data Crate
//!
//! Geometry utilities for the lumen reconstruction pipeline: density lattices,
//! iso-surface extraction, triangle meshes, and the `.obj` / `.glb` writers.
//! This crate knows nothing about the field model or training; it only turns
//! scalar grids into files on disk.

pub mod error;
pub mod export;
pub mod isosurface;
pub mod storage;
pub mod types;

pub use error::MeshError;
pub use export::{MeshPaths, export_density_to_mesh, write_mesh_files};
pub use isosurface::{extract_isosurface, extract_scaled};
pub use storage::{OutputStore, StorageKey};
pub use types::{DensityGrid, Mesh};
