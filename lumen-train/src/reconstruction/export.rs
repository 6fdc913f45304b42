//! Sampling a trained field onto a density lattice and writing its surface.

use crate::scene::{FieldError, FieldModel};
use glam::Vec3;
use lumen_data::{DensityGrid, Mesh, MeshError, MeshPaths, export_density_to_mesh};
use rand::SeedableRng;
use rand::distr::{Distribution, StandardUniform};
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Where the exported density lattice comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DensitySource {
    /// The trained field; a field without a surface at the threshold is an error.
    Field,
    /// Seeded uniform noise in `[0, 1)`, independent of the field.
    Noise,
    /// The trained field, replaced by noise when it has no surface at the threshold.
    #[default]
    FieldOrNoise,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Lattice points per axis.
    pub resolution: usize,
    /// World-space `[min, max]` of the sampled cube.
    pub bounds: [f32; 2],
    /// Iso-value separating inside from outside.
    pub threshold: f32,
    /// Grid-index to output scale applied to mesh vertices.
    pub voxel_size: f32,
    pub source: DensitySource,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            resolution: 32,
            bounds: [-1.0, 1.0],
            threshold: 0.5,
            voxel_size: 1.0,
            source: DensitySource::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error("invalid export configuration: {0}")]
    InvalidConfig(String),
}

impl ExportConfig {
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.resolution < 2 {
            return Err(ExportError::InvalidConfig(format!(
                "resolution {} needs at least 2 samples per axis",
                self.resolution
            )));
        }
        let [lo, hi] = self.bounds;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(ExportError::InvalidConfig(format!(
                "bounds [{lo}, {hi}] are not an ascending interval"
            )));
        }
        if !(self.voxel_size.is_finite() && self.voxel_size > 0.0) {
            return Err(ExportError::InvalidConfig(format!(
                "voxel size {} must be positive",
                self.voxel_size
            )));
        }
        Ok(())
    }

    fn coordinate(&self, i: usize) -> f32 {
        let [lo, hi] = self.bounds;
        lo + (hi - lo) * i as f32 / (self.resolution - 1) as f32
    }
}

/// Densities `relu(sigma)` of `model` at every lattice point, one x-slab per task.
#[tracing::instrument(skip_all, fields(resolution = config.resolution))]
pub fn sample_density_grid(
    model: &FieldModel,
    config: &ExportConfig,
) -> Result<DensityGrid, ExportError> {
    config.validate()?;
    let n = config.resolution;

    let slabs = (0..n)
        .into_par_iter()
        .map(|x| {
            let px = config.coordinate(x);
            let positions: Vec<Vec3> = (0..n)
                .flat_map(|y| (0..n).map(move |z| (y, z)))
                .map(|(y, z)| Vec3::new(px, config.coordinate(y), config.coordinate(z)))
                .collect();
            model
                .density(&positions)
                .map(|sigma| sigma.into_iter().map(|s| s.max(0.0)).collect::<Vec<f32>>())
        })
        .collect::<Result<Vec<_>, FieldError>>()?;

    let grid = DensityGrid::cube(n, slabs.concat())?;
    let (min, max) = grid.range();
    info!("Sampled {}^3 density grid, range [{:.4}, {:.4}]", n, min, max);
    Ok(grid)
}

/// Uniform noise in `[0, 1)` at every lattice point.
pub fn noise_grid(resolution: usize, seed: u64) -> Result<DensityGrid, ExportError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let values = (0..resolution.pow(3))
        .map(|_| -> f32 { StandardUniform.sample(&mut rng) })
        .collect();
    Ok(DensityGrid::cube(resolution, values)?)
}

/// The lattice selected by `config.source`, and the source it actually came from.
pub fn density_grid(
    model: &FieldModel,
    config: &ExportConfig,
    seed: u64,
) -> Result<(DensityGrid, DensitySource), ExportError> {
    config.validate()?;
    match config.source {
        DensitySource::Noise => Ok((noise_grid(config.resolution, seed)?, DensitySource::Noise)),
        DensitySource::Field => Ok((sample_density_grid(model, config)?, DensitySource::Field)),
        DensitySource::FieldOrNoise => {
            let grid = sample_density_grid(model, config)?;
            if grid.crosses(config.threshold) {
                return Ok((grid, DensitySource::Field));
            }
            let (min, max) = grid.range();
            warn!(
                "Field density range [{:.4}, {:.4}] never crosses {}, exporting seeded noise",
                min, max, config.threshold
            );
            Ok((noise_grid(config.resolution, seed)?, DensitySource::Noise))
        }
    }
}

/// Build the density lattice and write its iso-surface as `.obj` and `.glb`.
pub fn export_field_mesh(
    model: &FieldModel,
    config: &ExportConfig,
    seed: u64,
    paths: &MeshPaths,
) -> Result<(Mesh, DensitySource), ExportError> {
    let (grid, source) = density_grid(model, config, seed)?;
    let mesh = export_density_to_mesh(&grid, config.threshold, config.voxel_size, paths)?;
    Ok((mesh, source))
}
