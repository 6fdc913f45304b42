//! Text and image embeddings consumed by guidance.

use image::RgbImage;
use image::imageops::{self, FilterType};
use thiserror::Error;

/// Default embedding width shared by text and image vectors.
pub const DEFAULT_EMBEDDING_WIDTH: usize = 512;

const THUMBNAIL_SIZE: u32 = 8;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding width must be non-zero")]
    ZeroWidth,

    #[error("prompt contains no tokens")]
    EmptyText,

    #[error("image has no pixels")]
    EmptyImage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn norm(&self) -> f32 {
        self.0.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    fn normalized(mut self) -> Self {
        let norm = self.norm();
        if norm > 0.0 {
            for v in &mut self.0 {
                *v /= norm;
            }
        }
        self
    }
}

/// Maps prompts and images to vectors of one shared width.
pub trait Embedder: Send + Sync {
    fn width(&self) -> usize;

    fn embed_text(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    fn embed_image(&self, image: &RgbImage) -> Result<Embedding, EmbeddingError>;
}

/// Deterministic embedder without a learned model.
///
/// Text tokens are hashed into signed buckets; images are pooled to an 8x8
/// thumbnail whose centred channels fill the leading buckets. Both are
/// normalized to unit length.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    width: usize,
}

impl HashingEmbedder {
    pub fn new(width: usize) -> Result<Self, EmbeddingError> {
        if width == 0 {
            return Err(EmbeddingError::ZeroWidth);
        }
        Ok(Self { width })
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            width: DEFAULT_EMBEDDING_WIDTH,
        }
    }
}

/// 64-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

impl Embedder for HashingEmbedder {
    fn width(&self) -> usize {
        self.width
    }

    fn embed_text(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let mut values = vec![0.0f32; self.width];
        let mut tokens = 0;
        for token in text.split_whitespace() {
            let hash = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (hash % self.width as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            values[bucket] += sign;
            tokens += 1;
        }
        if tokens == 0 {
            return Err(EmbeddingError::EmptyText);
        }
        Ok(Embedding(values).normalized())
    }

    fn embed_image(&self, image: &RgbImage) -> Result<Embedding, EmbeddingError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(EmbeddingError::EmptyImage);
        }
        let thumb = imageops::resize(image, THUMBNAIL_SIZE, THUMBNAIL_SIZE, FilterType::Triangle);
        let mut values = vec![0.0f32; self.width];
        let channels = thumb.pixels().flat_map(|p| p.0);
        for (i, c) in channels.enumerate() {
            values[i % self.width] += f32::from(c) / 255.0 - 0.5;
        }
        Ok(Embedding(values).normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_text_embedding_is_unit_and_deterministic() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed_text("a small red chair").unwrap();
        assert_eq!(a.width(), 512);
        assert!((a.norm() - 1.0).abs() < 1e-5);
        assert_eq!(a, embedder.embed_text("A small  RED chair").unwrap());
        assert_ne!(a, embedder.embed_text("a tall blue lamp").unwrap());
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let embedder = HashingEmbedder::default();
        assert!(matches!(
            embedder.embed_text("   "),
            Err(EmbeddingError::EmptyText)
        ));
    }

    #[test]
    fn test_image_embedding_matches_text_width() {
        let embedder = HashingEmbedder::new(64).unwrap();
        let image = RgbImage::from_fn(32, 16, |x, y| Rgb([(x * 8) as u8, (y * 16) as u8, 40]));
        let e = embedder.embed_image(&image).unwrap();
        assert_eq!(e.width(), embedder.embed_text("lamp").unwrap().width());
        assert!((e.norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_zero_width_rejected() {
        assert!(matches!(HashingEmbedder::new(0), Err(EmbeddingError::ZeroWidth)));
    }
}
