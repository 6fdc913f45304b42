//! End-to-end generation: request in, trained field and mesh files out.

use crate::ingest::{
    DEFAULT_EMBEDDING_WIDTH, Embedder, EmbeddingError, GenerationRequest, HashingEmbedder,
};
use crate::reconstruction::cancel::CancellationToken;
use crate::reconstruction::export::{DensitySource, ExportConfig, ExportError, export_field_mesh};
use crate::reconstruction::guidance::{
    Guidance, GuidanceError, GuidanceKind, ReferenceColorGuidance, ZeroGuidance,
};
use crate::reconstruction::trainer::{TrainError, TrainReport, Trainer, TrainerConfig, TrainerState};
use crate::render::{RandomRays, RaySamplerConfig, SamplerError};
use crate::scene::{FieldConfig, FieldError, FieldModel};
use lumen_data::{Mesh, MeshError, MeshPaths, OutputStore, StorageKey};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub field: FieldConfig,
    pub sampler: RaySamplerConfig,
    pub trainer: TrainerConfig,
    pub export: ExportConfig,
    pub guidance: GuidanceKind,
    pub embedding_width: usize,
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            field: FieldConfig::default(),
            sampler: RaySamplerConfig::default(),
            trainer: TrainerConfig::default(),
            export: ExportConfig::default(),
            guidance: GuidanceKind::default(),
            embedding_width: DEFAULT_EMBEDDING_WIDTH,
            seed: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error(transparent)]
    Guidance(#[from] GuidanceError),

    #[error(transparent)]
    Train(#[from] TrainError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Storage(#[from] MeshError),
}

/// Everything a finished request produced.
#[derive(Debug)]
pub struct GenerationOutput {
    pub key: StorageKey,
    pub paths: MeshPaths,
    pub mesh: Mesh,
    /// Lattice the mesh was extracted from.
    pub density_source: DensitySource,
    pub report: TrainReport,
    pub model: FieldModel,
}

/// Response body for a finished request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSummary {
    pub id: String,
    pub obj_download: String,
    pub glb_download: String,
    pub vertices: usize,
    pub faces: usize,
    pub density_source: DensitySource,
    pub steps: usize,
    pub final_loss: Option<f32>,
    pub losses: Vec<f32>,
    pub state: TrainerState,
}

pub fn obj_download_link(key: &StorageKey) -> String {
    format!("/download/obj?id={key}")
}

pub fn glb_download_link(key: &StorageKey) -> String {
    format!("/download/glb?id={key}")
}

impl GenerationOutput {
    pub fn summary(&self) -> GenerationSummary {
        GenerationSummary {
            id: self.key.to_string(),
            obj_download: obj_download_link(&self.key),
            glb_download: glb_download_link(&self.key),
            vertices: self.mesh.vertex_count(),
            faces: self.mesh.face_count(),
            density_source: self.density_source,
            steps: self.report.steps,
            final_loss: self.report.final_loss(),
            losses: self.report.losses.clone(),
            state: self.report.state,
        }
    }
}

/// Runs generation requests against a shared output store.
///
/// Every call to [`Pipeline::generate`] builds its own field model, so requests
/// can run concurrently on one pipeline.
pub struct Pipeline {
    config: GenerationConfig,
    store: OutputStore,
    embedder: Box<dyn Embedder>,
    checkpoint: Option<FieldModel>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: GenerationConfig, store: OutputStore) -> Result<Self, PipelineError> {
        let embedder = HashingEmbedder::new(config.embedding_width)?;
        Ok(Self {
            config,
            store,
            embedder: Box::new(embedder),
            checkpoint: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_embedder(mut self, embedder: Box<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Start every run from `model` instead of a fresh initialization.
    pub fn with_checkpoint(mut self, model: FieldModel) -> Self {
        self.checkpoint = Some(model);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    fn initial_model(&self) -> Result<FieldModel, PipelineError> {
        match &self.checkpoint {
            Some(model) => {
                if model.config() != &self.config.field {
                    warn!("Checkpoint architecture differs from the configured field, using the checkpoint");
                }
                Ok(model.clone())
            }
            None => {
                let mut rng = StdRng::seed_from_u64(self.config.seed);
                Ok(FieldModel::new(self.config.field.clone(), &mut rng)?)
            }
        }
    }

    #[tracing::instrument(skip_all, fields(prompt = %request.prompt, images = request.images.len()))]
    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, PipelineError> {
        let config = &self.config;
        let reference = request.reference_image(config.seed);
        let text = self.embedder.embed_text(&request.prompt)?;
        let image = self.embedder.embed_image(&reference)?;

        let guidance: Box<dyn Guidance> = match config.guidance {
            GuidanceKind::Zero => Box::new(ZeroGuidance),
            GuidanceKind::ReferenceColor => Box::new(ReferenceColorGuidance::from_image(&reference)?),
        };
        let rays = RandomRays::new(config.sampler.clone(), config.seed.wrapping_add(1))?;
        let model = self.initial_model()?;
        info!(
            "Training {} parameters for {} steps with {} guidance",
            model.parameter_count(),
            config.trainer.steps,
            guidance.name()
        );

        let mut trainer = Trainer::new(
            config.trainer.clone(),
            model,
            Box::new(rays),
            guidance,
            text,
            Some(image),
        )?
        .with_cancellation(self.cancel.clone());
        trainer.run()?;

        let (key, paths) = self.store.allocate()?;
        let noise_seed = config.seed.wrapping_add(2);
        let exported = export_field_mesh(trainer.model(), &config.export, noise_seed, &paths);
        let (mesh, density_source) = match exported {
            Ok(exported) => exported,
            Err(err) => {
                if let Err(cleanup) = self.store.discard(&key) {
                    warn!("Failed to discard output directory {}: {}", key, cleanup);
                }
                return Err(err.into());
            }
        };
        let report = trainer.complete()?;
        info!(
            "Request {} done: {} vertices, {} faces",
            key,
            mesh.vertex_count(),
            mesh.face_count()
        );

        Ok(GenerationOutput {
            key,
            paths,
            mesh,
            density_source,
            report,
            model: trainer.into_model(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn small_config() -> GenerationConfig {
        GenerationConfig {
            field: FieldConfig {
                depth: 1,
                width: 4,
                skips: vec![],
                ..FieldConfig::default()
            },
            trainer: TrainerConfig {
                steps: 3,
                ..TrainerConfig::default()
            },
            export: ExportConfig {
                resolution: 8,
                ..ExportConfig::default()
            },
            embedding_width: 32,
            ..GenerationConfig::default()
        }
    }

    /// Density `|x|`, which crosses 0.5 inside the default bounds.
    fn slab_field(config: &FieldConfig) -> FieldModel {
        let mut model = FieldModel::new(config.clone(), &mut StdRng::seed_from_u64(0)).unwrap();
        let mut layers = model.layers_mut();
        layers[0].weight_mut().copy_from_slice(&[
            1.0, 0.0, 0.0, //
            -1.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0,
        ]);
        layers[0].bias_mut().fill(0.0);
        layers[2].weight_mut().copy_from_slice(&[1.0, 1.0, 0.0, 0.0]);
        layers[2].bias_mut().fill(0.0);
        model
    }

    #[test]
    fn test_generate_writes_both_files() {
        let root = tempdir().unwrap();
        let config = small_config();
        let field = slab_field(&config.field);
        let pipeline = Pipeline::new(config, OutputStore::new(root.path()))
            .unwrap()
            .with_checkpoint(field.clone());

        let output = pipeline.generate(&GenerationRequest::new("a flat slab")).unwrap();
        assert!(!output.mesh.is_empty());
        assert!(fs::metadata(&output.paths.obj).unwrap().len() > 0);
        assert!(fs::metadata(&output.paths.glb).unwrap().len() > 0);
        assert_eq!(output.report.state, TrainerState::Done);
        assert_eq!(output.density_source, DensitySource::Field);
        // zero guidance leaves the checkpoint untouched
        assert_eq!(output.model, field);

        let summary = output.summary();
        assert_eq!(summary.obj_download, format!("/download/obj?id={}", output.key));
        assert_eq!(summary.glb_download, format!("/download/glb?id={}", output.key));
        assert_eq!(summary.losses.len(), 3);
    }

    #[test]
    fn test_requests_get_separate_outputs() {
        let root = tempdir().unwrap();
        let config = small_config();
        let field = slab_field(&config.field);
        let pipeline = Pipeline::new(config, OutputStore::new(root.path()))
            .unwrap()
            .with_checkpoint(field);

        let a = pipeline.generate(&GenerationRequest::new("one")).unwrap();
        let b = pipeline.generate(&GenerationRequest::new("two")).unwrap();
        assert_ne!(a.key, b.key);
        assert_ne!(a.paths.obj, b.paths.obj);
    }

    #[test]
    fn test_concurrent_requests_share_nothing() {
        let root = tempdir().unwrap();
        let config = small_config();
        let field = slab_field(&config.field);
        let pipeline = Pipeline::new(config, OutputStore::new(root.path()))
            .unwrap()
            .with_checkpoint(field.clone());

        let outputs: Vec<GenerationOutput> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let pipeline = &pipeline;
                    s.spawn(move || {
                        pipeline
                            .generate(&GenerationRequest::new(format!("request {i}")))
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let keys: std::collections::HashSet<_> = outputs.iter().map(|o| o.key.clone()).collect();
        assert_eq!(keys.len(), outputs.len());
        let dirs: std::collections::HashSet<_> =
            outputs.iter().map(|o| o.paths.obj.parent().unwrap().to_path_buf()).collect();
        assert_eq!(dirs.len(), outputs.len());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), outputs.len());

        // Identical models and settings, so every request wrote the same bytes.
        let obj = fs::read(&outputs[0].paths.obj).unwrap();
        let glb = fs::read(&outputs[0].paths.glb).unwrap();
        assert!(obj.starts_with(b"# lumen mesh"));
        assert_eq!(&glb[..4], b"glTF");
        for output in &outputs {
            assert_eq!(output.model, field);
            assert_eq!(fs::read(&output.paths.obj).unwrap(), obj);
            assert_eq!(fs::read(&output.paths.glb).unwrap(), glb);
        }
    }

    #[test]
    fn test_default_config_runs_to_completion() {
        let root = tempdir().unwrap();
        let pipeline =
            Pipeline::new(GenerationConfig::default(), OutputStore::new(root.path())).unwrap();

        let output = pipeline.generate(&GenerationRequest::new("a red chair")).unwrap();
        assert_eq!(output.report.state, TrainerState::Done);
        assert_eq!(output.report.steps, 10);
        // A freshly initialized field stays far below the default threshold.
        assert_eq!(output.density_source, DensitySource::Noise);
        assert!(!output.mesh.is_empty());
        assert!(fs::metadata(&output.paths.obj).unwrap().len() > 0);
        assert!(fs::metadata(&output.paths.glb).unwrap().len() > 0);
    }

    #[test]
    fn test_empty_surface_leaves_no_output() {
        let root = tempdir().unwrap();
        let mut config = small_config();
        config.export.source = DensitySource::Field;
        let mut field = slab_field(&config.field);
        for layer in field.layers_mut() {
            layer.weight_mut().fill(0.0);
            layer.bias_mut().fill(0.0);
        }
        let pipeline = Pipeline::new(config, OutputStore::new(root.path()))
            .unwrap()
            .with_checkpoint(field);

        let result = pipeline.generate(&GenerationRequest::new("nothing"));
        assert!(matches!(
            result,
            Err(PipelineError::Export(ExportError::Mesh(MeshError::EmptySurface { .. })))
        ));
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_cancelled_run_allocates_nothing() {
        let root = tempdir().unwrap();
        let out = root.path().join("out");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline = Pipeline::new(small_config(), OutputStore::new(&out))
            .unwrap()
            .with_cancellation(cancel);

        let result = pipeline.generate(&GenerationRequest::new("a lamp"));
        assert!(matches!(
            result,
            Err(PipelineError::Train(TrainError::Cancelled { step: 1 }))
        ));
        assert!(!out.exists());
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let root = tempdir().unwrap();
        let pipeline = Pipeline::new(small_config(), OutputStore::new(root.path())).unwrap();
        assert!(matches!(
            pipeline.generate(&GenerationRequest::new("")),
            Err(PipelineError::Embedding(EmbeddingError::EmptyText))
        ));
    }

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: GenerationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, GenerationConfig::default());
        assert_eq!(config.field.depth, 8);
        assert_eq!(config.sampler.n_samples, 8);
        assert_eq!(config.export.resolution, 32);
        assert_eq!(config.embedding_width, 512);

        let partial: GenerationConfig =
            serde_json::from_str(r#"{"trainer": {"steps": 3, "optimizer": "sgd"}, "guidance": "reference-color"}"#)
                .unwrap();
        assert_eq!(partial.trainer.steps, 3);
        assert_eq!(partial.trainer.learning_rate, 5e-4);
        assert_eq!(partial.guidance, GuidanceKind::ReferenceColor);
    }
}
