//! First-order parameter optimizers.
//!
//! Parameters are addressed by slot: every weight or bias buffer of the model
//! gets a stable index so stateful optimizers can keep per-buffer moments.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    Adam,
    Sgd,
}

impl OptimizerKind {
    pub fn build(self, learning_rate: f32) -> Box<dyn Optimizer> {
        match self {
            Self::Adam => Box::new(Adam::new(learning_rate)),
            Self::Sgd => Box::new(Sgd::new(learning_rate)),
        }
    }
}

pub trait Optimizer: Send {
    /// Called once per step before any [`Optimizer::update`].
    fn begin_step(&mut self) {}

    /// Apply one descent update to `params` in place.
    fn update(&mut self, slot: usize, params: &mut [f32], grads: &[f32]);
}

#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn update(&mut self, _slot: usize, params: &mut [f32], grads: &[f32]) {
        for (p, g) in params.iter_mut().zip(grads) {
            *p -= self.learning_rate * g;
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: i32,
    moments: Vec<Moments>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            moments: Vec::new(),
        }
    }

    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn begin_step(&mut self) {
        self.t += 1;
    }

    fn update(&mut self, slot: usize, params: &mut [f32], grads: &[f32]) {
        if self.moments.len() <= slot {
            self.moments.resize_with(slot + 1, Moments::default);
        }
        let state = &mut self.moments[slot];
        if state.m.len() != params.len() {
            state.m = vec![0.0; params.len()];
            state.v = vec![0.0; params.len()];
        }

        let t = self.t.max(1);
        let bc1 = 1.0 - self.beta1.powi(t);
        let bc2 = 1.0 - self.beta2.powi(t);
        for i in 0..params.len() {
            let g = grads[i];
            state.m[i] = self.beta1 * state.m[i] + (1.0 - self.beta1) * g;
            state.v[i] = self.beta2 * state.v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = state.m[i] / bc1;
            let v_hat = state.v[i] / bc2;
            params[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.eps);
        }
    }
}
