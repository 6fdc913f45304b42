//! Mesh file export.
//!
//! A mesh is always written as a pair of sibling files: Wavefront `.obj` text
//! and binary glTF `.glb`. Both encodings are produced in memory first, so an
//! encoding failure never leaves a half-written pair behind.

mod glb;
mod obj;

pub use glb::mesh_to_glb_bytes;
pub use obj::{mesh_to_obj_bytes, write_obj};

use crate::error::MeshError;
use crate::isosurface::extract_scaled;
use crate::types::{DensityGrid, Mesh};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Destination paths for an exported mesh pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshPaths {
    pub obj: PathBuf,
    pub glb: PathBuf,
}

impl MeshPaths {
    pub fn new(obj: impl Into<PathBuf>, glb: impl Into<PathBuf>) -> Self {
        Self {
            obj: obj.into(),
            glb: glb.into(),
        }
    }

    /// `<dir>/<stem>.obj` and `<dir>/<stem>.glb`.
    pub fn in_dir(dir: &Path, stem: &str) -> Self {
        Self {
            obj: dir.join(format!("{stem}.obj")),
            glb: dir.join(format!("{stem}.glb")),
        }
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), MeshError> {
    fs::write(path, bytes).map_err(|source| MeshError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `mesh` to both formats. Either both files exist afterwards or neither does.
#[tracing::instrument(skip_all, fields(obj = %paths.obj.display(), glb = %paths.glb.display()))]
pub fn write_mesh_files(mesh: &Mesh, paths: &MeshPaths) -> Result<(), MeshError> {
    let obj = mesh_to_obj_bytes(mesh)?;
    let glb = mesh_to_glb_bytes(mesh)?;

    write_file(&paths.obj, &obj)?;
    if let Err(err) = write_file(&paths.glb, &glb) {
        if let Err(cleanup) = fs::remove_file(&paths.obj) {
            warn!("Failed to remove {} after GLB error: {}", paths.obj.display(), cleanup);
        }
        return Err(err);
    }

    info!(
        "Exported mesh to {} ({} bytes) and {} ({} bytes)",
        paths.obj.display(),
        obj.len(),
        paths.glb.display(),
        glb.len()
    );
    Ok(())
}

/// Extract the iso-surface of `grid` at `level`, scale it by `voxel_size`, and write both files.
pub fn export_density_to_mesh(
    grid: &DensityGrid,
    level: f32,
    voxel_size: f32,
    paths: &MeshPaths,
) -> Result<Mesh, MeshError> {
    let mesh = extract_scaled(grid, level, voxel_size)?;
    write_mesh_files(&mesh, paths)?;
    Ok(mesh)
}
