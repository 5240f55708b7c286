//! Hybrid retrieval over corrected text chunks.
//!
//! A keyword ranking (BM25) keeps exact identifiers such as `OBS.R01`
//! findable; a semantic ranking finds paraphrases. The two are fused by
//! reciprocal rank so neither score scale dominates.

pub mod hybrid;
pub mod keyword;
pub mod semantic;

pub use hybrid::HybridIndex;
pub use keyword::{tokenize, Bm25Index};
pub use semantic::{cosine_similarity, EmbeddingModel, HashingEmbedder, OllamaEmbedder};

use crate::config::{EmbedderKind, GenerationConfig, RetrievalConfig};
use crate::types::{BoundingBox, ContentType};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where an indexed chunk came from; every search hit carries it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub page: u32,
    pub citation_id: String,
    pub bbox: BoundingBox,
    pub content_type: ContentType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub text: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

/// Embedder selected by configuration
pub fn embedder_from_config(retrieval: &RetrievalConfig, generation: &GenerationConfig) -> Box<dyn EmbeddingModel> {
    match retrieval.embedder {
        EmbedderKind::Hashing => Box::new(HashingEmbedder::new(retrieval.embedding_dimension)),
        EmbedderKind::Ollama => Box::new(OllamaEmbedder::new(
            &generation.base_url,
            &retrieval.embedding_model,
            retrieval.embedding_dimension,
            Duration::from_secs(generation.timeout_secs),
        )),
    }
}
