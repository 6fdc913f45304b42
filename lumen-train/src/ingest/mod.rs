//! Request ingestion
//!
//! Turns an incoming generation request into what the optimizer consumes:
//! - Reference image selection (first upload, or a seeded placeholder)
//! - Text and image embeddings

pub mod embedding;
pub mod reference;

pub use embedding::{DEFAULT_EMBEDDING_WIDTH, Embedder, Embedding, EmbeddingError, HashingEmbedder};
pub use reference::{GenerationRequest, IngestError, PLACEHOLDER_SIZE, load_image, placeholder_image};
