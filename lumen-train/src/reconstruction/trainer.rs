//! The optimizer loop: sample, render, score, backpropagate, update.

use crate::ingest::Embedding;
use crate::reconstruction::cancel::CancellationToken;
use crate::reconstruction::guidance::{Guidance, GuidanceError, RenderedImage};
use crate::reconstruction::optimizer::{Optimizer, OptimizerKind};
use crate::render::{RaySource, RenderError, RenderGrad, SamplerError, render_backward, render_rays};
use crate::scene::{FieldError, FieldGradients, FieldModel};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub steps: usize,
    pub learning_rate: f32,
    pub optimizer: OptimizerKind,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            steps: 10,
            learning_rate: 5e-4,
            optimizer: OptimizerKind::Adam,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerState {
    Initialized,
    Stepping { step: usize },
    Exporting,
    Done,
    /// Stopped by an error or cancellation at `step`; nothing can resume it.
    Failed { step: usize },
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Guidance(#[from] GuidanceError),

    #[error("non-finite {what} at step {step}")]
    NonFinite { step: usize, what: &'static str },

    #[error("guidance returned {actual} pixel gradients for {expected} rays at step {step}")]
    GradientShape {
        step: usize,
        expected: usize,
        actual: usize,
    },

    #[error("training cancelled before step {step}")]
    Cancelled { step: usize },

    #[error("cannot {action} while {state:?}")]
    InvalidState {
        state: TrainerState,
        action: &'static str,
    },

    #[error("invalid trainer configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub step: usize,
    pub loss: f32,
    pub grad_norm: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainReport {
    pub steps: usize,
    pub losses: Vec<f32>,
    pub state: TrainerState,
}

impl TrainReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.losses.last().copied()
    }
}

/// Owns the field model for the duration of a run.
pub struct Trainer {
    config: TrainerConfig,
    model: FieldModel,
    rays: Box<dyn RaySource>,
    guidance: Box<dyn Guidance>,
    optimizer: Box<dyn Optimizer>,
    text: Embedding,
    reference: Option<Embedding>,
    cancel: CancellationToken,
    state: TrainerState,
    losses: Vec<f32>,
}

impl Trainer {
    pub fn new(
        config: TrainerConfig,
        model: FieldModel,
        rays: Box<dyn RaySource>,
        guidance: Box<dyn Guidance>,
        text: Embedding,
        reference: Option<Embedding>,
    ) -> Result<Self, TrainError> {
        if !(config.learning_rate.is_finite() && config.learning_rate > 0.0) {
            return Err(TrainError::InvalidConfig(format!(
                "learning rate {} must be positive",
                config.learning_rate
            )));
        }
        let optimizer = config.optimizer.build(config.learning_rate);
        Ok(Self {
            config,
            model,
            rays,
            guidance,
            optimizer,
            text,
            reference,
            cancel: CancellationToken::new(),
            state: TrainerState::Initialized,
            losses: Vec::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn model(&self) -> &FieldModel {
        &self.model
    }

    pub fn into_model(self) -> FieldModel {
        self.model
    }

    pub fn losses(&self) -> &[f32] {
        &self.losses
    }

    /// Run one optimizer step.
    pub fn step(&mut self) -> Result<StepReport, TrainError> {
        if !matches!(self.state, TrainerState::Initialized | TrainerState::Stepping { .. }) {
            return Err(TrainError::InvalidState {
                state: self.state,
                action: "step",
            });
        }
        let step = self.losses.len() + 1;
        match self.try_step(step) {
            Ok(report) => Ok(report),
            Err(err) => {
                warn!("Step {} failed: {}", step, err);
                self.state = TrainerState::Failed { step };
                Err(err)
            }
        }
    }

    fn try_step(&mut self, step: usize) -> Result<StepReport, TrainError> {
        let batch = self.rays.sample()?;
        let features = batch.features();
        let (raw, field_cache) = self.model.forward_cached(&features)?;
        let (rendered, render_cache) = render_rays(&raw, batch.z_vals(), batch.directions())?;
        if !rendered.is_finite() {
            return Err(TrainError::NonFinite { step, what: "render" });
        }

        let image = RenderedImage::from_rays(&rendered);
        let signal = self
            .guidance
            .evaluate(&image, &self.text, self.reference.as_ref())?;
        if !signal.loss.is_finite() {
            return Err(TrainError::NonFinite { step, what: "loss" });
        }
        if signal.grad.len() != rendered.n_rays() {
            return Err(TrainError::GradientShape {
                step,
                expected: rendered.n_rays(),
                actual: signal.grad.len(),
            });
        }

        let mut grad = RenderGrad::zeros(rendered.n_rays());
        grad.rgb = signal.grad;
        if !grad.is_finite() {
            return Err(TrainError::NonFinite { step, what: "image gradient" });
        }
        let grad_raw = render_backward(&render_cache, &grad);
        let grads = self.model.backward(&field_cache, &grad_raw);
        if !grads.is_finite() {
            return Err(TrainError::NonFinite { step, what: "parameter gradient" });
        }
        let grad_norm = grads.norm();
        self.apply(&grads);

        self.losses.push(signal.loss);
        self.state = TrainerState::Stepping { step };
        debug!(
            "Step {} used {} rays x {} samples, gradient norm {:.6}",
            step,
            batch.n_rays(),
            batch.n_samples(),
            grad_norm
        );
        info!("Step {}/{} | loss {:.4}", step, self.config.steps, signal.loss);
        Ok(StepReport {
            step,
            loss: signal.loss,
            grad_norm,
        })
    }

    fn apply(&mut self, grads: &FieldGradients) {
        self.optimizer.begin_step();
        let layers = self.model.layers_mut().into_iter().zip(grads.iter());
        for (slot, (layer, grad)) in layers.enumerate() {
            self.optimizer.update(2 * slot, layer.weight_mut(), &grad.weight);
            self.optimizer.update(2 * slot + 1, layer.bias_mut(), &grad.bias);
        }
    }

    /// Run the remaining step budget, then move to exporting.
    #[tracing::instrument(skip_all, fields(steps = self.config.steps, guidance = self.guidance.name()))]
    pub fn run(&mut self) -> Result<TrainReport, TrainError> {
        while self.losses.len() < self.config.steps {
            if self.cancel.is_cancelled() {
                let step = self.losses.len() + 1;
                self.state = TrainerState::Failed { step };
                return Err(TrainError::Cancelled { step });
            }
            self.step()?;
        }
        if !matches!(self.state, TrainerState::Initialized | TrainerState::Stepping { .. }) {
            return Err(TrainError::InvalidState {
                state: self.state,
                action: "run",
            });
        }
        self.state = TrainerState::Exporting;
        info!("Training finished after {} steps", self.losses.len());
        Ok(self.report())
    }

    /// Mark the exported run as done.
    pub fn complete(&mut self) -> Result<TrainReport, TrainError> {
        if self.state != TrainerState::Exporting {
            return Err(TrainError::InvalidState {
                state: self.state,
                action: "complete",
            });
        }
        self.state = TrainerState::Done;
        Ok(self.report())
    }

    pub fn report(&self) -> TrainReport {
        TrainReport {
            steps: self.losses.len(),
            losses: self.losses.clone(),
            state: self.state,
        }
    }
}
