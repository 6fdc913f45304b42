//! Guidance oracles that score rendered images.

use crate::ingest::Embedding;
use crate::render::Rendered;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuidanceError {
    #[error("rendered image is {width}x{height} but carries {pixels} pixels")]
    PixelCount {
        width: usize,
        height: usize,
        pixels: usize,
    },

    #[error("text embedding width {text} differs from image embedding width {image}")]
    EmbeddingWidth { text: usize, image: usize },

    #[error("reference image has no pixels")]
    EmptyReference,
}

/// Which guidance implementation a run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuidanceKind {
    #[default]
    Zero,
    ReferenceColor,
}

/// Rendered ray colours arranged as an image, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<[f32; 3]>,
}

impl RenderedImage {
    /// One row with a pixel per ray.
    pub fn from_rays(rendered: &Rendered) -> Self {
        Self {
            width: rendered.rgb.len(),
            height: 1,
            pixels: rendered.rgb.clone(),
        }
    }

    fn check(&self) -> Result<(), GuidanceError> {
        if self.pixels.len() != self.width * self.height {
            return Err(GuidanceError::PixelCount {
                width: self.width,
                height: self.height,
                pixels: self.pixels.len(),
            });
        }
        Ok(())
    }
}

/// Scalar loss and its gradient with respect to every rendered pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct GuidanceSignal {
    pub loss: f32,
    pub grad: Vec<[f32; 3]>,
}

pub trait Guidance: Send {
    fn name(&self) -> &'static str;

    fn evaluate(
        &mut self,
        image: &RenderedImage,
        text: &Embedding,
        reference: Option<&Embedding>,
    ) -> Result<GuidanceSignal, GuidanceError>;
}

fn check_inputs(
    image: &RenderedImage,
    text: &Embedding,
    reference: Option<&Embedding>,
) -> Result<(), GuidanceError> {
    image.check()?;
    if let Some(reference) = reference
        && reference.width() != text.width()
    {
        return Err(GuidanceError::EmbeddingWidth {
            text: text.width(),
            image: reference.width(),
        });
    }
    Ok(())
}

/// Constant zero loss with a zero gradient.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroGuidance;

impl Guidance for ZeroGuidance {
    fn name(&self) -> &'static str {
        "zero"
    }

    fn evaluate(
        &mut self,
        image: &RenderedImage,
        text: &Embedding,
        reference: Option<&Embedding>,
    ) -> Result<GuidanceSignal, GuidanceError> {
        check_inputs(image, text, reference)?;
        Ok(GuidanceSignal {
            loss: 0.0,
            grad: vec![[0.0; 3]; image.pixels.len()],
        })
    }
}

/// Mean squared error between rendered pixels and a fixed target colour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceColorGuidance {
    target: [f32; 3],
}

impl ReferenceColorGuidance {
    pub fn new(target: [f32; 3]) -> Self {
        Self { target }
    }

    /// Target the mean colour of `image`.
    pub fn from_image(image: &RgbImage) -> Result<Self, GuidanceError> {
        let count = image.pixels().len();
        if count == 0 {
            return Err(GuidanceError::EmptyReference);
        }
        let mut sum = [0.0f64; 3];
        for pixel in image.pixels() {
            for (s, &c) in sum.iter_mut().zip(&pixel.0) {
                *s += f64::from(c);
            }
        }
        let target = sum.map(|s| (s / count as f64 / 255.0) as f32);
        Ok(Self { target })
    }

    pub fn target(&self) -> [f32; 3] {
        self.target
    }
}

impl Guidance for ReferenceColorGuidance {
    fn name(&self) -> &'static str {
        "reference-color"
    }

    fn evaluate(
        &mut self,
        image: &RenderedImage,
        text: &Embedding,
        reference: Option<&Embedding>,
    ) -> Result<GuidanceSignal, GuidanceError> {
        check_inputs(image, text, reference)?;
        let n = (image.pixels.len() * 3).max(1) as f32;
        let mut loss = 0.0;
        let grad = image
            .pixels
            .iter()
            .map(|pixel| {
                let mut g = [0.0; 3];
                for c in 0..3 {
                    let diff = pixel[c] - self.target[c];
                    loss += diff * diff / n;
                    g[c] = 2.0 * diff / n;
                }
                g
            })
            .collect();
        Ok(GuidanceSignal { loss, grad })
    }
}
