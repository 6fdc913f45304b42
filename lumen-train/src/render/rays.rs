//! Ray batches and the sources that produce them.

use crate::scene::Matrix;
use glam::Vec3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaySamplerConfig {
    pub n_rays: usize,
    pub n_samples: usize,
    pub near: f32,
    pub far: f32,
}

impl Default for RaySamplerConfig {
    fn default() -> Self {
        Self {
            n_rays: 2,
            n_samples: 8,
            near: 0.0,
            far: 1.0,
        }
    }
}

impl RaySamplerConfig {
    pub fn validate(&self) -> Result<(), SamplerError> {
        if self.n_rays == 0 || self.n_samples == 0 {
            return Err(SamplerError::EmptyBatch {
                n_rays: self.n_rays,
                n_samples: self.n_samples,
            });
        }
        let ordered = self.near.is_finite() && self.far.is_finite() && self.near < self.far;
        if !ordered {
            return Err(SamplerError::InvalidRange {
                near: self.near,
                far: self.far,
            });
        }
        Ok(())
    }

    /// `n_samples` depths evenly spaced over `[near, far]`.
    pub fn depths(&self) -> Vec<f32> {
        if self.n_samples == 1 {
            return vec![self.near];
        }
        let step = (self.far - self.near) / (self.n_samples - 1) as f32;
        (0..self.n_samples)
            .map(|i| self.near + step * i as f32)
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("ray batch needs at least one ray and one sample, got {n_rays}x{n_samples}")]
    EmptyBatch { n_rays: usize, n_samples: usize },

    #[error("sample range [{near}, {far}] is not a finite ascending interval")]
    InvalidRange { near: f32, far: f32 },

    #[error("sample depths of ray {ray} are not strictly ascending")]
    NotAscending { ray: usize },

    #[error("ray batch has {origins} origins, {directions} directions and {depths} depths for {n_rays}x{n_samples}")]
    Mismatch {
        n_rays: usize,
        n_samples: usize,
        origins: usize,
        directions: usize,
        depths: usize,
    },
}

/// Rays with per-ray sample depths, stored ray-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RayBatch {
    n_samples: usize,
    origins: Vec<Vec3>,
    directions: Vec<Vec3>,
    z_vals: Vec<f32>,
}

impl RayBatch {
    pub fn new(
        origins: Vec<Vec3>,
        directions: Vec<Vec3>,
        z_vals: Vec<f32>,
        n_samples: usize,
    ) -> Result<Self, SamplerError> {
        let n_rays = origins.len();
        if n_rays == 0 || n_samples == 0 {
            return Err(SamplerError::EmptyBatch { n_rays, n_samples });
        }
        if directions.len() != n_rays || z_vals.len() != n_rays * n_samples {
            return Err(SamplerError::Mismatch {
                n_rays,
                n_samples,
                origins: n_rays,
                directions: directions.len(),
                depths: z_vals.len(),
            });
        }
        for (ray, depths) in z_vals.chunks(n_samples).enumerate() {
            let ascending = depths.iter().all(|z| z.is_finite())
                && depths.windows(2).all(|w| w[0] < w[1]);
            if !ascending {
                return Err(SamplerError::NotAscending { ray });
            }
        }
        Ok(Self {
            n_samples,
            origins,
            directions,
            z_vals,
        })
    }

    pub fn n_rays(&self) -> usize {
        self.origins.len()
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn origins(&self) -> &[Vec3] {
        &self.origins
    }

    pub fn directions(&self) -> &[Vec3] {
        &self.directions
    }

    /// Sample depths, `n_samples` per ray.
    pub fn z_vals(&self) -> &[f32] {
        &self.z_vals
    }

    pub fn ray_depths(&self, ray: usize) -> &[f32] {
        &self.z_vals[ray * self.n_samples..(ray + 1) * self.n_samples]
    }

    /// Field input rows `[o + z d, d]`, one per (ray, sample).
    pub fn features(&self) -> Matrix {
        let mut features = Matrix::zeros(self.z_vals.len(), 6);
        let mut row = 0;
        for (ray, (o, d)) in self.origins.iter().zip(&self.directions).enumerate() {
            for &z in self.ray_depths(ray) {
                let out = features.row_mut(row);
                out[..3].copy_from_slice(&(*o + *d * z).to_array());
                out[3..].copy_from_slice(&d.to_array());
                row += 1;
            }
        }
        features
    }
}

/// Anything that yields ray batches for the optimizer loop.
///
/// Implementations must keep per-ray depths strictly ascending.
pub trait RaySource: Send {
    fn sample(&mut self) -> Result<RayBatch, SamplerError>;
}

/// Origins and directions drawn from a standard normal distribution, depths
/// evenly spaced over the configured range.
#[derive(Debug)]
pub struct RandomRays {
    config: RaySamplerConfig,
    depths: Vec<f32>,
    rng: StdRng,
}

impl RandomRays {
    pub fn new(config: RaySamplerConfig, seed: u64) -> Result<Self, SamplerError> {
        config.validate()?;
        let depths = config.depths();
        Ok(Self {
            config,
            depths,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn config(&self) -> &RaySamplerConfig {
        &self.config
    }

    fn normal_vec3(&mut self) -> Vec3 {
        Vec3::from_array(std::array::from_fn(|_| StandardNormal.sample(&mut self.rng)))
    }
}

impl RaySource for RandomRays {
    fn sample(&mut self) -> Result<RayBatch, SamplerError> {
        let n_rays = self.config.n_rays;
        let origins = (0..n_rays).map(|_| self.normal_vec3()).collect();
        let directions = (0..n_rays).map(|_| self.normal_vec3()).collect();
        let z_vals = self.depths.repeat(n_rays);
        RayBatch::new(origins, directions, z_vals, self.config.n_samples)
    }
}

/// Replays one batch on every call.
#[derive(Debug, Clone)]
pub struct FixedRays {
    batch: RayBatch,
}

impl FixedRays {
    pub fn new(batch: RayBatch) -> Self {
        Self { batch }
    }
}

impl RaySource for FixedRays {
    fn sample(&mut self) -> Result<RayBatch, SamplerError> {
        Ok(self.batch.clone())
    }
}
