//! Lumen Training Crate
//!
//! This crate provides the volumetric side of prompt-to-mesh generation: a
//! radiance field MLP with hand-derived gradients, random ray sampling, an
//! alpha-compositing volume renderer, and the optimizer loop that ties them to
//! a guidance signal before the field is exported as a mesh.
//!
//! ## Modules
//!
//! - [`ingest`]: Generation requests, reference images, and embeddings
//! - [`scene`]: Radiance field model and its linear algebra
//! - [`render`]: Ray batches and differentiable volume rendering
//! - [`reconstruction`]: Guidance, optimizers, the training loop, and export

pub mod ingest;
pub mod reconstruction;
pub mod render;
pub mod scene;

pub use ingest::GenerationRequest;
pub use reconstruction::{GenerationConfig, Pipeline, PipelineError};
pub use scene::{FieldConfig, FieldModel};
