//! Request handling with builder pattern.

use crate::config::{AppConfig, LoggingConfig};
use lumen_data::{OutputStore, StorageKey};
use lumen_train::ingest::load_image;
use lumen_train::reconstruction::{CancellationToken, GenerationSummary};
use lumen_train::{FieldModel, GenerationRequest, Pipeline};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid output id {0:?}")]
    InvalidId(String),

    #[error("no {format} mesh stored under id {id}")]
    NotFound { id: String, format: MeshFormat },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum MeshFormat {
    Obj,
    Glb,
}

impl std::fmt::Display for MeshFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Obj => "obj",
            Self::Glb => "glb",
        })
    }
}

/// Builder for one invocation of the lumen front end.
pub struct AppBuilder {
    config: AppConfig,
    checkpoint: Option<PathBuf>,
    save_checkpoint: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl AppBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            checkpoint: None,
            save_checkpoint: None,
            timeout: None,
        }
    }

    /// Start training from a saved field instead of a fresh one.
    pub fn with_checkpoint(mut self, path: Option<PathBuf>) -> Self {
        self.checkpoint = path;
        self
    }

    /// Save the trained field after a successful run.
    pub fn with_checkpoint_output(mut self, path: Option<PathBuf>) -> Self {
        self.save_checkpoint = path;
        self
    }

    /// Cancel training once this much wall time has passed.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Train a field for `prompt`, export its mesh, and describe the result.
    pub fn generate(
        self,
        prompt: &str,
        images: &[PathBuf],
    ) -> Result<GenerationSummary, Box<dyn Error>> {
        init_logging(&self.config.logging);

        let mut request = GenerationRequest::new(prompt);
        for path in images {
            request = request.with_image(load_image(path)?);
        }

        let cancel = self
            .timeout
            .map(CancellationToken::with_timeout)
            .unwrap_or_default();
        let store = OutputStore::new(&self.config.output_dir);
        let mut pipeline = Pipeline::new(self.config.generation.clone(), store)?
            .with_cancellation(cancel);
        if let Some(path) = &self.checkpoint {
            pipeline = pipeline.with_checkpoint(FieldModel::load_json(path)?);
        }

        let output = pipeline.generate(&request)?;
        if let Some(path) = &self.save_checkpoint {
            output.model.save_json(path)?;
        }
        info!(
            "Wrote {} and {}",
            output.paths.obj.display(),
            output.paths.glb.display()
        );
        Ok(output.summary())
    }

    /// Path of a previously generated mesh file.
    pub fn locate(self, id: &str, format: MeshFormat) -> Result<PathBuf, Box<dyn Error>> {
        init_logging(&self.config.logging);

        let key = StorageKey::parse(id).ok_or_else(|| AppError::InvalidId(id.to_string()))?;
        let not_found = || AppError::NotFound {
            id: id.to_string(),
            format,
        };
        let paths = OutputStore::new(&self.config.output_dir)
            .resolve(&key)
            .ok_or_else(not_found)?;
        let path = match format {
            MeshFormat::Obj => paths.obj,
            MeshFormat::Glb => paths.glb,
        };
        if !path.is_file() {
            return Err(not_found().into());
        }
        Ok(path)
    }
}

fn init_logging(config: &LoggingConfig) {
    // A second initialization in the same process keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level)),
        )
        .with_target(false)
        .try_init();
}
