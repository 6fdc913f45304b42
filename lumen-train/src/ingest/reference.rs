//! Generation requests and reference image selection.

use image::{Rgb, RgbImage};
use rand::SeedableRng;
use rand::distr::{Distribution, StandardUniform};
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Side length of the placeholder used when a request carries no image.
pub const PLACEHOLDER_SIZE: u32 = 224;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to read image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// A text prompt with zero or more uploaded reference images.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub images: Vec<RgbImage>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            images: Vec::new(),
        }
    }

    pub fn with_image(mut self, image: RgbImage) -> Self {
        self.images.push(image);
        self
    }

    /// The image that guides the run: the first upload, or a seeded placeholder.
    pub fn reference_image(&self, seed: u64) -> RgbImage {
        match self.images.split_first() {
            Some((first, rest)) => {
                if !rest.is_empty() {
                    warn!("Using the first of {} images, ignoring the rest", self.images.len());
                }
                first.clone()
            }
            None => {
                info!(
                    "No reference image, using {}x{} placeholder",
                    PLACEHOLDER_SIZE, PLACEHOLDER_SIZE
                );
                placeholder_image(seed)
            }
        }
    }
}

/// Uniform RGB noise of [`PLACEHOLDER_SIZE`] squared.
pub fn placeholder_image(seed: u64) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(seed);
    RgbImage::from_fn(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, |_, _| {
        Rgb(StandardUniform.sample(&mut rng))
    })
}

#[tracing::instrument(skip_all, fields(path = %path.display()))]
pub fn load_image(path: &Path) -> Result<RgbImage, IngestError> {
    let image = image::open(path)
        .map_err(|source| IngestError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    info!("Loaded {}x{} reference image", image.width(), image.height());
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_is_seeded() {
        let a = placeholder_image(3);
        assert_eq!(a.dimensions(), (224, 224));
        assert_eq!(a, placeholder_image(3));
        assert_ne!(a, placeholder_image(4));
    }

    #[test]
    fn test_first_image_wins() {
        let red = RgbImage::from_pixel(4, 4, Rgb([255, 0, 0]));
        let blue = RgbImage::from_pixel(8, 8, Rgb([0, 0, 255]));
        let request = GenerationRequest::new("a red cube")
            .with_image(red.clone())
            .with_image(blue);
        assert_eq!(request.reference_image(0), red);
    }

    #[test]
    fn test_missing_image_uses_placeholder() {
        let request = GenerationRequest::new("a chair");
        assert_eq!(request.reference_image(9).dimensions(), (224, 224));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.png");
        assert!(matches!(
            load_image(&path),
            Err(IngestError::Image { .. })
        ));
    }
}
