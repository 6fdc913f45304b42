//! Fully-connected layer with an explicit backward pass.

use crate::scene::{FieldError, Matrix};
use rand::Rng;
use rand::distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

/// `y = x Wᵀ + b`, with `W` stored as `out_dim` rows of `in_dim` weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    in_dim: usize,
    out_dim: usize,
    weight: Vec<f32>,
    bias: Vec<f32>,
}

/// Gradients of a loss with respect to one layer's parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearGrad {
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

impl Linear {
    /// Weights and biases drawn uniformly from `±1/sqrt(in_dim)`.
    pub fn new(in_dim: usize, out_dim: usize, rng: &mut dyn Rng) -> Result<Self, FieldError> {
        let bound = 1.0 / (in_dim.max(1) as f32).sqrt();
        let init = Uniform::new_inclusive(-bound, bound).map_err(|e| {
            FieldError::InvalidConfig(format!("initialization range ±{bound}: {e}"))
        })?;
        let weight = (0..in_dim * out_dim).map(|_| init.sample(rng)).collect();
        let bias = (0..out_dim).map(|_| init.sample(rng)).collect();
        Ok(Self {
            in_dim,
            out_dim,
            weight,
            bias,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    pub fn weight_mut(&mut self) -> &mut [f32] {
        &mut self.weight
    }

    pub fn bias_mut(&mut self) -> &mut [f32] {
        &mut self.bias
    }

    pub fn parameter_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    /// Whether the stored buffers agree with the declared dimensions.
    pub fn is_consistent(&self) -> bool {
        self.weight.len() == self.in_dim * self.out_dim && self.bias.len() == self.out_dim
    }

    pub fn forward(&self, x: &Matrix) -> Matrix {
        debug_assert_eq!(x.cols(), self.in_dim);
        let mut out = Matrix::zeros(x.rows(), self.out_dim);
        for r in 0..x.rows() {
            let input = x.row(r);
            let output = out.row_mut(r);
            for (o, y) in output.iter_mut().enumerate() {
                let w = &self.weight[o * self.in_dim..(o + 1) * self.in_dim];
                *y = self.bias[o] + w.iter().zip(input).map(|(a, b)| a * b).sum::<f32>();
            }
        }
        out
    }

    /// Returns the gradient with respect to `x` and the parameter gradients.
    ///
    /// Parameter gradients are summed over the batch.
    pub fn backward(&self, x: &Matrix, grad_out: &Matrix) -> (Matrix, LinearGrad) {
        debug_assert_eq!(x.rows(), grad_out.rows());
        debug_assert_eq!(grad_out.cols(), self.out_dim);

        let mut grad = LinearGrad::zeros(self);
        let mut grad_in = Matrix::zeros(x.rows(), self.in_dim);
        for r in 0..x.rows() {
            let input = x.row(r);
            let g_out = grad_out.row(r);
            let g_in = grad_in.row_mut(r);
            for (o, &g) in g_out.iter().enumerate() {
                if g == 0.0 {
                    continue;
                }
                grad.bias[o] += g;
                let w = &self.weight[o * self.in_dim..(o + 1) * self.in_dim];
                let gw = &mut grad.weight[o * self.in_dim..(o + 1) * self.in_dim];
                for i in 0..self.in_dim {
                    gw[i] += g * input[i];
                    g_in[i] += g * w[i];
                }
            }
        }
        (grad_in, grad)
    }
}

impl LinearGrad {
    pub fn zeros(layer: &Linear) -> Self {
        Self {
            weight: vec![0.0; layer.weight.len()],
            bias: vec![0.0; layer.bias.len()],
        }
    }

    pub fn is_finite(&self) -> bool {
        self.weight.iter().chain(&self.bias).all(|v| v.is_finite())
    }

    pub fn squared_norm(&self) -> f32 {
        self.weight.iter().chain(&self.bias).map(|v| v * v).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn layer() -> Linear {
        Linear {
            in_dim: 3,
            out_dim: 2,
            weight: vec![0.1, 0.2, 0.3, -0.4, 0.5, -0.6],
            bias: vec![0.01, -0.02],
        }
    }

    #[test]
    fn test_forward_matches_manual() {
        let x = Matrix::from_vec(1, 3, vec![1.0, -2.0, 0.5]).unwrap();
        let y = layer().forward(&x);
        let expected0 = 0.01 + 0.1 * 1.0 + 0.2 * -2.0 + 0.3 * 0.5;
        let expected1 = -0.02 + -0.4 * 1.0 + 0.5 * -2.0 + -0.6 * 0.5;
        assert!((y.get(0, 0) - expected0).abs() < 1e-6);
        assert!((y.get(0, 1) - expected1).abs() < 1e-6);
    }

    #[test]
    fn test_backward_sums_over_batch() {
        let layer = layer();
        let x = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0]).unwrap();
        let g = Matrix::from_vec(2, 2, vec![1.0, 0.0, 2.0, -1.0]).unwrap();
        let (g_in, grad) = layer.backward(&x, &g);

        assert_eq!(grad.bias, vec![3.0, -1.0]);
        // dW[o][i] = sum_r g[r][o] * x[r][i]
        assert_eq!(grad.weight[..3], [1.0 - 2.0, 2.0, 3.0 + 2.0]);
        assert_eq!(grad.weight[3..], [1.0, 0.0, -1.0]);
        // dx[r][i] = sum_o g[r][o] * W[o][i]
        assert!((g_in.get(0, 0) - 0.1).abs() < 1e-6);
        assert!((g_in.get(1, 2) - (2.0 * 0.3 + 0.6)).abs() < 1e-6);
    }

    #[test]
    fn test_init_respects_fan_in_bound() {
        let mut rng = StdRng::seed_from_u64(9);
        let layer = Linear::new(16, 8, &mut rng).unwrap();
        assert!(layer.is_consistent());
        assert_eq!(layer.parameter_count(), 16 * 8 + 8);
        assert!(layer.weight().iter().chain(layer.bias()).all(|w| w.abs() <= 0.25));
    }
}
