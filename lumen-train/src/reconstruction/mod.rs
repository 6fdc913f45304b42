//! Scene reconstruction from a prompt
//!
//! This module drives a radiance field from its initial parameters to an
//! exported mesh: guidance scoring, parameter updates, the step loop with its
//! state machine, and the final field-to-mesh conversion.

pub mod cancel;
pub mod export;
pub mod guidance;
pub mod optimizer;
pub mod pipeline;
pub mod trainer;

pub use cancel::CancellationToken;
pub use export::{
    DensitySource, ExportConfig, ExportError, density_grid, export_field_mesh, noise_grid,
    sample_density_grid,
};
pub use guidance::{
    Guidance, GuidanceError, GuidanceKind, GuidanceSignal, ReferenceColorGuidance, RenderedImage,
    ZeroGuidance,
};
pub use optimizer::{Adam, Optimizer, OptimizerKind, Sgd};
pub use pipeline::{
    GenerationConfig, GenerationOutput, GenerationSummary, Pipeline, PipelineError,
    glb_download_link, obj_download_link,
};
pub use trainer::{StepReport, TrainError, TrainReport, Trainer, TrainerConfig, TrainerState};
