//! Radiance field MLP.
//!
//! A trunk of `depth` linear+ReLU layers over position features, with the raw
//! positions re-injected after every layer listed in `skips`. The trunk output
//! feeds a density head and, together with the view direction, a colour head.

use crate::scene::{FieldError, Linear, LinearGrad, Matrix};
use glam::Vec3;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Architecture of a [`FieldModel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    /// Number of trunk layers.
    pub depth: usize,
    /// Trunk width.
    pub width: usize,
    /// Position feature channels.
    pub input_ch: usize,
    /// View direction feature channels.
    pub input_ch_dir: usize,
    /// Trunk layers after which the position features are concatenated back in.
    pub skips: Vec<usize>,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            depth: 8,
            width: 256,
            input_ch: 3,
            input_ch_dir: 3,
            skips: vec![4],
        }
    }
}

impl FieldConfig {
    /// Feature row width expected by [`FieldModel::forward`].
    pub fn input_width(&self) -> usize {
        self.input_ch + self.input_ch_dir
    }

    pub fn validate(&self) -> Result<(), FieldError> {
        if self.depth == 0 {
            return Err(FieldError::InvalidConfig("depth must be at least 1".into()));
        }
        if self.width < 2 {
            return Err(FieldError::InvalidConfig(format!(
                "width {} leaves no colour branch",
                self.width
            )));
        }
        if self.input_ch == 0 {
            return Err(FieldError::InvalidConfig(
                "input_ch must be at least 1".into(),
            ));
        }
        if let Some(skip) = self.skips.iter().find(|&&s| s + 1 >= self.depth) {
            return Err(FieldError::InvalidConfig(format!(
                "skip after layer {skip} has no following layer (depth {})",
                self.depth
            )));
        }
        Ok(())
    }

    /// Input width of trunk layer `i`.
    fn trunk_in(&self, i: usize) -> usize {
        match i {
            0 => self.input_ch,
            _ if self.skips.contains(&(i - 1)) => self.width + self.input_ch,
            _ => self.width,
        }
    }

    fn views_in(&self) -> usize {
        self.width + self.input_ch_dir
    }
}

/// Activations kept from a forward pass for [`FieldModel::backward`].
#[derive(Debug, Clone)]
pub struct FieldCache {
    trunk_inputs: Vec<Matrix>,
    trunk_acts: Vec<Matrix>,
    trunk_out: Matrix,
    views_input: Matrix,
    views_act: Matrix,
}

/// Parameter gradients, one entry per layer in [`FieldModel::layers`] order.
#[derive(Debug, Clone)]
pub struct FieldGradients {
    pub trunk: Vec<LinearGrad>,
    pub feature: LinearGrad,
    pub alpha: LinearGrad,
    pub views: LinearGrad,
    pub rgb: LinearGrad,
}

impl FieldGradients {
    pub fn iter(&self) -> impl Iterator<Item = &LinearGrad> {
        self.trunk
            .iter()
            .chain([&self.feature, &self.alpha, &self.views, &self.rgb])
    }

    pub fn is_finite(&self) -> bool {
        self.iter().all(LinearGrad::is_finite)
    }

    pub fn norm(&self) -> f32 {
        self.iter().map(LinearGrad::squared_norm).sum::<f32>().sqrt()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldModel {
    config: FieldConfig,
    trunk: Vec<Linear>,
    feature: Linear,
    alpha: Linear,
    views: Linear,
    rgb: Linear,
}

impl FieldModel {
    pub fn new(config: FieldConfig, rng: &mut dyn Rng) -> Result<Self, FieldError> {
        config.validate()?;
        let w = config.width;
        let trunk = (0..config.depth)
            .map(|i| Linear::new(config.trunk_in(i), w, rng))
            .collect::<Result<Vec<_>, _>>()?;
        let alpha = Linear::new(w, 1, rng)?;
        let feature = Linear::new(w, w, rng)?;
        let views = Linear::new(config.views_in(), w / 2, rng)?;
        let rgb = Linear::new(w / 2, 3, rng)?;

        let model = Self {
            config,
            trunk,
            feature,
            alpha,
            views,
            rgb,
        };
        debug!(
            "Field model with {} parameters (depth {}, width {}, skips {:?})",
            model.parameter_count(),
            model.config.depth,
            model.config.width,
            model.config.skips
        );
        Ok(model)
    }

    pub fn config(&self) -> &FieldConfig {
        &self.config
    }

    /// Layers in canonical order: trunk, feature, alpha, views, rgb.
    pub fn layers(&self) -> Vec<&Linear> {
        let mut layers: Vec<&Linear> = self.trunk.iter().collect();
        layers.extend([&self.feature, &self.alpha, &self.views, &self.rgb]);
        layers
    }

    pub fn layers_mut(&mut self) -> Vec<&mut Linear> {
        let mut layers: Vec<&mut Linear> = self.trunk.iter_mut().collect();
        layers.push(&mut self.feature);
        layers.push(&mut self.alpha);
        layers.push(&mut self.views);
        layers.push(&mut self.rgb);
        layers
    }

    pub fn parameter_count(&self) -> usize {
        self.layers().iter().map(|l| l.parameter_count()).sum()
    }

    /// Evaluate `(K, input_ch + input_ch_dir)` feature rows into `(K, 4)` raw
    /// `[r, g, b, sigma]`.
    pub fn forward(&self, x: &Matrix) -> Result<Matrix, FieldError> {
        self.forward_cached(x).map(|(out, _)| out)
    }

    pub fn forward_cached(&self, x: &Matrix) -> Result<(Matrix, FieldCache), FieldError> {
        self.check_width(x.cols())?;
        let (pts, dirs) = x.split_cols(self.config.input_ch);

        let (trunk_out, trunk_inputs, trunk_acts) = self.run_trunk(&pts);
        let sigma = self.alpha.forward(&trunk_out);
        let feature = self.feature.forward(&trunk_out);
        let views_input = Matrix::hconcat(&feature, &dirs);
        let views_act = self.views.forward(&views_input).relu();
        let color = self.rgb.forward(&views_act);

        let out = Matrix::hconcat(&color, &sigma);
        let cache = FieldCache {
            trunk_inputs,
            trunk_acts,
            trunk_out,
            views_input,
            views_act,
        };
        Ok((out, cache))
    }

    /// Gradients of the parameters given the gradient of the `(K, 4)` output.
    pub fn backward(&self, cache: &FieldCache, grad_out: &Matrix) -> FieldGradients {
        let (g_color, g_sigma) = grad_out.split_cols(3);

        let (g_views_act, rgb) = self.rgb.backward(&cache.views_act, &g_color);
        let g_views_pre = g_views_act.relu_backward(&cache.views_act);
        let (g_views_in, views) = self.views.backward(&cache.views_input, &g_views_pre);
        let (g_feature, _) = g_views_in.split_cols(self.config.width);

        let (mut g_h, feature) = self.feature.backward(&cache.trunk_out, &g_feature);
        let (g_h_alpha, alpha) = self.alpha.backward(&cache.trunk_out, &g_sigma);
        g_h.add_assign(&g_h_alpha);

        let mut trunk = Vec::with_capacity(self.trunk.len());
        for (i, layer) in self.trunk.iter().enumerate().rev() {
            if self.config.skips.contains(&i) {
                g_h = g_h.split_cols(self.config.input_ch).1;
            }
            let g_pre = g_h.relu_backward(&cache.trunk_acts[i]);
            let (g_in, grad) = layer.backward(&cache.trunk_inputs[i], &g_pre);
            trunk.push(grad);
            g_h = g_in;
        }
        trunk.reverse();

        FieldGradients {
            trunk,
            feature,
            alpha,
            views,
            rgb,
        }
    }

    /// Raw density at world positions. View direction does not affect density.
    pub fn density(&self, positions: &[Vec3]) -> Result<Vec<f32>, FieldError> {
        if self.config.input_ch != 3 {
            return Err(FieldError::InputWidth {
                expected: self.config.input_width(),
                actual: 3 + self.config.input_ch_dir,
            });
        }
        let data = positions.iter().flat_map(|p| p.to_array()).collect();
        let pts = Matrix::from_vec(positions.len(), 3, data)?;
        let (trunk_out, _, _) = self.run_trunk(&pts);
        Ok(self.alpha.forward(&trunk_out).into_vec())
    }

    fn check_width(&self, actual: usize) -> Result<(), FieldError> {
        let expected = self.config.input_width();
        if actual != expected {
            return Err(FieldError::InputWidth { expected, actual });
        }
        Ok(())
    }

    fn run_trunk(&self, pts: &Matrix) -> (Matrix, Vec<Matrix>, Vec<Matrix>) {
        let mut inputs = Vec::with_capacity(self.trunk.len());
        let mut acts = Vec::with_capacity(self.trunk.len());
        let mut h = pts.clone();
        for (i, layer) in self.trunk.iter().enumerate() {
            let act = layer.forward(&h).relu();
            let next = if self.config.skips.contains(&i) {
                Matrix::hconcat(pts, &act)
            } else {
                act.clone()
            };
            inputs.push(std::mem::replace(&mut h, next));
            acts.push(act);
        }
        (h, inputs, acts)
    }

    /// Check that every layer matches the shapes implied by the configuration.
    pub fn from_checkpoint(model: FieldModel) -> Result<Self, FieldError> {
        let config = &model.config;
        config
            .validate()
            .map_err(|e| FieldError::Checkpoint(format!("invalid config: {e}")))?;
        if model.trunk.len() != config.depth {
            return Err(FieldError::Checkpoint(format!(
                "expected {} trunk layers, found {}",
                config.depth,
                model.trunk.len()
            )));
        }
        let w = config.width;
        let mut expected: Vec<(usize, usize)> =
            (0..config.depth).map(|i| (config.trunk_in(i), w)).collect();
        expected.extend([(w, w), (w, 1), (config.views_in(), w / 2), (w / 2, 3)]);

        let layers = model.layers().into_iter().zip(expected).enumerate();
        for (index, (layer, (in_dim, out_dim))) in layers {
            if layer.in_dim() != in_dim || layer.out_dim() != out_dim || !layer.is_consistent() {
                return Err(FieldError::Checkpoint(format!(
                    "layer {index} is {}x{}, expected {in_dim}x{out_dim}",
                    layer.in_dim(),
                    layer.out_dim()
                )));
            }
        }
        Ok(model)
    }

    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn save_json(&self, path: &Path) -> Result<(), FieldError> {
        let json = serde_json::to_vec(self)?;
        fs::write(path, json).map_err(|source| FieldError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Saved field checkpoint ({} parameters)", self.parameter_count());
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn load_json(path: &Path) -> Result<Self, FieldError> {
        let bytes = fs::read(path).map_err(|source| FieldError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let model = Self::from_checkpoint(serde_json::from_slice(&bytes)?)?;
        info!("Loaded field checkpoint ({} parameters)", model.parameter_count());
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::distr::{Distribution, Uniform};
    use rand::rngs::StdRng;

    fn small_config() -> FieldConfig {
        FieldConfig {
            depth: 3,
            width: 8,
            input_ch: 3,
            input_ch_dir: 3,
            skips: vec![0],
        }
    }

    fn random_matrix(rows: usize, cols: usize, rng: &mut StdRng) -> Matrix {
        let dist = Uniform::new_inclusive(-1.0, 1.0).unwrap();
        let data = (0..rows * cols).map(|_| dist.sample(rng)).collect();
        Matrix::from_vec(rows, cols, data).unwrap()
    }

    #[test]
    fn test_output_shape_for_any_batch() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = FieldModel::new(FieldConfig::default(), &mut rng).unwrap();
        for k in [1, 5, 16] {
            let x = random_matrix(k, 6, &mut rng);
            let out = model.forward(&x).unwrap();
            assert_eq!((out.rows(), out.cols()), (k, 4));
            assert!(out.is_finite());
        }
    }

    #[test]
    fn test_default_parameter_count() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = FieldModel::new(FieldConfig::default(), &mut rng).unwrap();
        // trunk 1024 + 6 * 65792 + 66560 (skip-widened), then heads
        // alpha 257, feature 65792, views 33280, rgb 387
        assert_eq!(model.parameter_count(), 562_052);
        assert_eq!(model.layers()[5].in_dim(), 259);
        assert_eq!(model.layers().len(), 12);
    }

    #[test]
    fn test_input_width_mismatch() {
        let mut rng = StdRng::seed_from_u64(1);
        let model = FieldModel::new(small_config(), &mut rng).unwrap();
        let x = Matrix::zeros(2, 5);
        assert!(matches!(
            model.forward(&x),
            Err(FieldError::InputWidth {
                expected: 6,
                actual: 5
            })
        ));
    }

    #[test]
    fn test_skip_after_last_layer_rejected() {
        let config = FieldConfig {
            skips: vec![7],
            ..FieldConfig::default()
        };
        assert!(matches!(config.validate(), Err(FieldError::InvalidConfig(_))));
    }

    #[test]
    fn test_density_matches_forward_sigma() {
        let mut rng = StdRng::seed_from_u64(2);
        let model = FieldModel::new(small_config(), &mut rng).unwrap();
        let positions = [Vec3::new(0.1, -0.2, 0.3), Vec3::new(-0.5, 0.4, 0.0)];
        let density = model.density(&positions).unwrap();

        let mut data = Vec::new();
        for p in &positions {
            data.extend(p.to_array());
            data.extend([0.7, -0.1, 0.2]);
        }
        let out = model.forward(&Matrix::from_vec(2, 6, data).unwrap()).unwrap();
        for (i, d) in density.iter().enumerate() {
            assert!((d - out.get(i, 3)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut model = FieldModel::new(small_config(), &mut rng).unwrap();
        let x = random_matrix(4, 6, &mut rng);
        let upstream = random_matrix(4, 4, &mut rng);

        let loss = |m: &FieldModel| -> f32 {
            let out = m.forward(&x).unwrap();
            out.data().iter().zip(upstream.data()).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = model.forward_cached(&x).unwrap();
        let grads = model.backward(&cache, &upstream);
        let analytic: Vec<LinearGrad> = grads.iter().cloned().collect();

        let eps = 1e-3;
        for layer_index in 0..analytic.len() {
            for param in [0usize, 1] {
                let original = model.layers()[layer_index].weight()[param];

                model.layers_mut()[layer_index].weight_mut()[param] = original + eps;
                let plus = loss(&model);
                model.layers_mut()[layer_index].weight_mut()[param] = original - eps;
                let minus = loss(&model);
                model.layers_mut()[layer_index].weight_mut()[param] = original;

                let numeric = (plus - minus) / (2.0 * eps);
                let exact = analytic[layer_index].weight[param];
                assert!(
                    (numeric - exact).abs() < 1e-2 * (1.0 + exact.abs()),
                    "layer {layer_index} weight {param}: numeric {numeric} analytic {exact}"
                );
            }
        }
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut rng = StdRng::seed_from_u64(4);
        let model = FieldModel::new(small_config(), &mut rng).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field.json");

        model.save_json(&path).unwrap();
        let loaded = FieldModel::load_json(&path).unwrap();
        assert_eq!(loaded, model);
    }

    #[test]
    fn test_checkpoint_shape_mismatch_rejected() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut model = FieldModel::new(small_config(), &mut rng).unwrap();
        model.config.width = 16;
        assert!(matches!(
            FieldModel::from_checkpoint(model),
            Err(FieldError::Checkpoint(_))
        ));
    }
}
