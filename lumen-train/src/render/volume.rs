//! Alpha compositing of raw field samples along rays, with its reverse pass.

use crate::scene::Matrix;
use glam::Vec3;
use thiserror::Error;

/// Length given to the interval behind the last sample of every ray.
pub const FAR_DISTANCE: f32 = 1e10;

/// Added to every transmittance factor so the running product never reaches zero.
pub const TRANSMITTANCE_EPS: f32 = 1e-10;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("raw samples are {rows}x{cols}, expected {expected_rows}x4")]
    RawShape {
        rows: usize,
        cols: usize,
        expected_rows: usize,
    },

    #[error("{depths} sample depths do not divide evenly over {rays} rays")]
    DepthLayout { depths: usize, rays: usize },
}

/// Per-ray composited outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub rgb: Vec<[f32; 3]>,
    pub depth: Vec<f32>,
    pub acc: Vec<f32>,
    /// Compositing weights, `n_samples` per ray.
    pub weights: Vec<f32>,
}

impl Rendered {
    pub fn n_rays(&self) -> usize {
        self.depth.len()
    }

    pub fn is_finite(&self) -> bool {
        self.rgb.iter().flatten().all(|v| v.is_finite())
            && self.depth.iter().chain(&self.acc).all(|v| v.is_finite())
    }
}

/// Upstream gradients with respect to [`Rendered`] outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderGrad {
    pub rgb: Vec<[f32; 3]>,
    pub depth: Vec<f32>,
    pub acc: Vec<f32>,
}

impl RenderGrad {
    pub fn zeros(n_rays: usize) -> Self {
        Self {
            rgb: vec![[0.0; 3]; n_rays],
            depth: vec![0.0; n_rays],
            acc: vec![0.0; n_rays],
        }
    }

    pub fn is_finite(&self) -> bool {
        self.rgb.iter().flatten().all(|v| v.is_finite())
            && self.depth.iter().chain(&self.acc).all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SampleState {
    color: [f32; 3],
    raw_sigma: f32,
    dist: f32,
    decay: f32,
    alpha: f32,
    trans: f32,
    weight: f32,
}

/// Intermediate values from [`render_rays`] needed by [`render_backward`].
#[derive(Debug, Clone)]
pub struct RenderCache {
    n_samples: usize,
    z_vals: Vec<f32>,
    samples: Vec<SampleState>,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Composite raw `[r, g, b, sigma]` rows (ray-major, `n_samples` per ray).
pub fn render_rays(
    raw: &Matrix,
    z_vals: &[f32],
    directions: &[Vec3],
) -> Result<(Rendered, RenderCache), RenderError> {
    let n_rays = directions.len();
    if n_rays == 0 || z_vals.len() % n_rays != 0 {
        return Err(RenderError::DepthLayout {
            depths: z_vals.len(),
            rays: n_rays,
        });
    }
    let n_samples = z_vals.len() / n_rays;
    if raw.rows() != z_vals.len() || raw.cols() != 4 {
        return Err(RenderError::RawShape {
            rows: raw.rows(),
            cols: raw.cols(),
            expected_rows: z_vals.len(),
        });
    }

    let mut rendered = Rendered {
        rgb: Vec::with_capacity(n_rays),
        depth: Vec::with_capacity(n_rays),
        acc: Vec::with_capacity(n_rays),
        weights: Vec::with_capacity(z_vals.len()),
    };
    let mut samples = Vec::with_capacity(z_vals.len());

    for (ray, direction) in directions.iter().enumerate() {
        let scale = direction.length();
        let z = &z_vals[ray * n_samples..(ray + 1) * n_samples];
        let mut trans = 1.0f32;
        let mut rgb = [0.0f32; 3];
        let mut depth = 0.0;
        let mut acc = 0.0;

        for s in 0..n_samples {
            let row = raw.row(ray * n_samples + s);
            let color = [sigmoid(row[0]), sigmoid(row[1]), sigmoid(row[2])];
            let sigma = row[3].max(0.0);
            let interval = if s + 1 < n_samples {
                z[s + 1] - z[s]
            } else {
                FAR_DISTANCE
            };
            let dist = interval * scale;
            let decay = (-sigma * dist).exp();
            let alpha = 1.0 - decay;
            let weight = alpha * trans;

            for c in 0..3 {
                rgb[c] += weight * color[c];
            }
            depth += weight * z[s];
            acc += weight;

            samples.push(SampleState {
                color,
                raw_sigma: row[3],
                dist,
                decay,
                alpha,
                trans,
                weight,
            });
            rendered.weights.push(weight);
            trans *= 1.0 - alpha + TRANSMITTANCE_EPS;
        }

        rendered.rgb.push(rgb);
        rendered.depth.push(depth);
        rendered.acc.push(acc);
    }

    let cache = RenderCache {
        n_samples,
        z_vals: z_vals.to_vec(),
        samples,
    };
    Ok((rendered, cache))
}

/// Gradient of the loss with respect to the raw samples passed to [`render_rays`].
pub fn render_backward(cache: &RenderCache, grad: &RenderGrad) -> Matrix {
    let n_samples = cache.n_samples;
    let mut grad_raw = Matrix::zeros(cache.samples.len(), 4);
    let mut grad_weight = vec![0.0f32; n_samples];

    for (ray, states) in cache.samples.chunks(n_samples).enumerate() {
        let g_rgb = grad.rgb[ray];
        let z = &cache.z_vals[ray * n_samples..(ray + 1) * n_samples];

        for (s, state) in states.iter().enumerate() {
            let dot: f32 = (0..3).map(|c| g_rgb[c] * state.color[c]).sum();
            grad_weight[s] = dot + grad.depth[ray] * z[s] + grad.acc[ray];

            let out = grad_raw.row_mut(ray * n_samples + s);
            for c in 0..3 {
                let sig = state.color[c];
                out[c] = state.weight * g_rgb[c] * sig * (1.0 - sig);
            }
        }

        // later samples depend on alpha_k through their transmittance
        let mut suffix = 0.0f32;
        for (s, state) in states.iter().enumerate().rev() {
            let d_alpha =
                grad_weight[s] * state.trans - suffix / (1.0 - state.alpha + TRANSMITTANCE_EPS);
            suffix += grad_weight[s] * state.weight;

            let d_sigma = d_alpha * state.dist * state.decay;
            let out = grad_raw.row_mut(ray * n_samples + s);
            out[3] = if state.raw_sigma > 0.0 { d_sigma } else { 0.0 };
        }
    }
    grad_raw
}
