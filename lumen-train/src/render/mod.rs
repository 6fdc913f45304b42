//! Ray generation and differentiable volume rendering.

pub mod rays;
pub mod volume;

pub use rays::{FixedRays, RandomRays, RayBatch, RaySamplerConfig, RaySource, SamplerError};
pub use volume::{RenderCache, RenderError, RenderGrad, Rendered, render_backward, render_rays};
