//! Lumen Application
//!
//! Command-line front end for prompt-to-mesh generation.
//!
//! Features:
//! - Trains a radiance field from a prompt and optional reference images
//! - Exports the learned surface as `.obj` and `.glb` under a per-request id
//! - Resolves ids back to mesh files for download

mod app;
mod config;

use app::{AppBuilder, MeshFormat};
use clap::{Parser, Subcommand, ValueEnum};
use config::{AppConfig, ConfigError};
use lumen_train::reconstruction::GuidanceKind;
use std::path::PathBuf;
use std::time::Duration;

/// Lumen - prompt-to-mesh volumetric reconstruction
#[derive(Parser, Debug)]
#[command(name = "lumen")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root directory for generated meshes
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a field for a prompt and export its mesh
    Generate {
        /// Text prompt
        prompt: String,

        /// Reference image; only the first one guides the run
        #[arg(short, long = "image")]
        images: Vec<PathBuf>,

        /// Optimizer steps
        #[arg(long)]
        steps: Option<usize>,

        /// Seed for initialization, rays and the placeholder image
        #[arg(long)]
        seed: Option<u64>,

        /// Export lattice points per axis
        #[arg(long)]
        resolution: Option<usize>,

        /// Iso-value for surface extraction
        #[arg(long)]
        threshold: Option<f32>,

        /// Guidance signal
        #[arg(long, value_enum)]
        guidance: Option<GuidanceArg>,

        /// Field checkpoint to start from
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Where to save the trained field
        #[arg(long)]
        save_checkpoint: Option<PathBuf>,

        /// Cancel training after this many seconds
        #[arg(long)]
        max_seconds: Option<u64>,
    },

    /// Print the path of a generated mesh
    Locate {
        /// Output id returned by `generate`
        id: String,

        #[arg(long, value_enum, default_value = "obj")]
        format: MeshFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GuidanceArg {
    Zero,
    ReferenceColor,
}

impl From<GuidanceArg> for GuidanceKind {
    fn from(arg: GuidanceArg) -> Self {
        match arg {
            GuidanceArg::Zero => GuidanceKind::Zero,
            GuidanceArg::ReferenceColor => GuidanceKind::ReferenceColor,
        }
    }
}

fn load_config(args: &Args) -> Result<AppConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Command::Generate {
        steps,
        seed,
        resolution,
        threshold,
        guidance,
        ..
    } = &args.command
    {
        let generation = &mut config.generation;
        if let Some(steps) = steps {
            generation.trainer.steps = *steps;
        }
        if let Some(seed) = seed {
            generation.seed = *seed;
        }
        if let Some(resolution) = resolution {
            generation.export.resolution = *resolution;
        }
        if let Some(threshold) = threshold {
            generation.export.threshold = *threshold;
        }
        if let Some(guidance) = guidance {
            generation.guidance = (*guidance).into();
        }
    }
    Ok(config)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    match args.command {
        Command::Generate {
            prompt,
            images,
            checkpoint,
            save_checkpoint,
            max_seconds,
            ..
        } => {
            let summary = AppBuilder::new(config)
                .with_checkpoint(checkpoint)
                .with_checkpoint_output(save_checkpoint)
                .with_timeout(max_seconds.map(Duration::from_secs))
                .generate(&prompt, &images)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Locate { id, format } => {
            let path = AppBuilder::new(config).locate(&id, format)?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Application error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "lumen",
            "--output-dir",
            "/tmp/meshes",
            "generate",
            "a red chair",
            "--steps",
            "3",
            "--threshold",
            "0.2",
            "--guidance",
            "reference-color",
            "-i",
            "a.png",
            "-i",
            "b.png",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/meshes"));
        assert_eq!(config.generation.trainer.steps, 3);
        assert_eq!(config.generation.export.threshold, 0.2);
        assert_eq!(config.generation.guidance, GuidanceKind::ReferenceColor);
        assert_eq!(config.generation.export.resolution, 32);
        match args.command {
            Command::Generate { images, .. } => assert_eq!(images.len(), 2),
            Command::Locate { .. } => panic!("expected generate"),
        }
    }

    #[test]
    fn test_locate_defaults_to_obj() {
        let args = Args::parse_from(["lumen", "locate", "abc-1"]);
        assert!(matches!(
            args.command,
            Command::Locate {
                format: MeshFormat::Obj,
                ..
            }
        ));
    }
}
