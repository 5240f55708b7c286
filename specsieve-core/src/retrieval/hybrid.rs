use super::keyword::Bm25Index;
use super::semantic::{rank_by_similarity, EmbeddingModel};
use super::{IndexEntry, SearchResult};
use crate::config::RetrievalConfig;
use crate::error::RetrievalError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Keyword and vector indices over the same entries, fused at query time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridIndex {
    entries: Vec<IndexEntry>,
    embeddings: Vec<Vec<f32>>,
    keyword: Bm25Index,
    embedder: String,
    dimension: usize,
    rrf_k: f32,
}

impl HybridIndex {
    pub fn build(
        entries: Vec<IndexEntry>,
        embedder: &dyn EmbeddingModel,
        config: &RetrievalConfig,
    ) -> Result<Self, RetrievalError> {
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        let embeddings = embedder.embed_batch(&texts)?;
        let dimension = embedder.dimension();
        if let Some(bad) = embeddings.iter().find(|v| v.len() != dimension) {
            return Err(RetrievalError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }
        let keyword = Bm25Index::build(texts.iter().copied(), config.bm25_k1, config.bm25_b);

        info!(entries = entries.len(), embedder = %embedder.name(), "Built hybrid index");
        Ok(Self {
            entries,
            embeddings,
            keyword,
            embedder: embedder.name(),
            dimension,
            rrf_k: config.rrf_k,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Fused ranking: `alpha / (k + r_sem) + (1 - alpha) / (k + r_kw)`.
    /// A document absent from one ranking contributes nothing from it;
    /// documents absent from both are not returned.
    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        alpha: f32,
        embedder: &dyn EmbeddingModel,
    ) -> Result<Vec<SearchResult>, RetrievalError> {
        if self.is_empty() {
            return Err(RetrievalError::EmptyIndex);
        }
        let alpha = alpha.clamp(0.0, 1.0);

        let query_vector = embedder.embed(query)?;
        if query_vector.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual: query_vector.len(),
            });
        }
        let semantic = rank_by_similarity(&query_vector, &self.embeddings);
        let keyword = self.keyword.search(query);

        let mut fused: BTreeMap<usize, f32> = BTreeMap::new();
        for (rank, (idx, _)) in semantic.iter().enumerate() {
            *fused.entry(*idx).or_insert(0.0) += alpha / (self.rrf_k + (rank + 1) as f32);
        }
        for (rank, (idx, _)) in keyword.iter().enumerate() {
            *fused.entry(*idx).or_insert(0.0) += (1.0 - alpha) / (self.rrf_k + (rank + 1) as f32);
        }

        let mut ranked: Vec<(usize, f32)> = fused.into_iter().filter(|(_, s)| *s > 0.0).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(top_k);

        debug!(
            query,
            semantic = semantic.len(),
            keyword = keyword.len(),
            returned = ranked.len(),
            "Hybrid search"
        );

        Ok(ranked
            .into_iter()
            .map(|(idx, score)| SearchResult {
                text: self.entries[idx].text.clone(),
                metadata: self.entries[idx].metadata.clone(),
                score,
            })
            .collect())
    }

    /// Keyword ranking only, raw BM25 scores
    pub fn search_keyword(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>, RetrievalError> {
        if self.is_empty() {
            return Err(RetrievalError::EmptyIndex);
        }
        Ok(self
            .keyword
            .search(query)
            .into_iter()
            .take(top_k)
            .map(|(idx, score)| SearchResult {
                text: self.entries[idx].text.clone(),
                metadata: self.entries[idx].metadata.clone(),
                score,
            })
            .collect())
    }

    pub fn save(&self, path: &Path) -> Result<(), RetrievalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, RetrievalError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Name of the embedder the vectors were built with
    pub fn embedder_name(&self) -> &str {
        &self.embedder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::semantic::HashingEmbedder;
    use crate::retrieval::ChunkMetadata;
    use crate::types::{BoundingBox, ContentType};

    fn entry(page: u32, citation_id: &str, text: &str) -> IndexEntry {
        IndexEntry {
            text: text.to_string(),
            metadata: ChunkMetadata {
                document_id: "doc".to_string(),
                page,
                citation_id: citation_id.to_string(),
                bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                content_type: ContentType::Text,
            },
        }
    }

    fn corpus() -> Vec<IndexEntry> {
        vec![
            entry(1, "p1_txt1", "OBS.R01 carries the observation result"),
            entry(1, "p1_txt2", "glucose value reported in mg/dL"),
            entry(2, "p2_txt1", "serial port baud rate 9600"),
            entry(2, "p2_txt2", "ORU.R01 unsolicited observation message"),
        ]
    }

    #[test]
    fn alpha_extremes_reproduce_single_rankings() {
        let embedder = HashingEmbedder::new(128);
        let config = RetrievalConfig::default();
        let index = HybridIndex::build(corpus(), &embedder, &config).unwrap();
        let query = "observation result";

        let semantic: Vec<usize> = rank_by_similarity(&embedder.embed(query).unwrap(), &index.embeddings)
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        let fused: Vec<String> = index
            .search(query, 10, 1.0, &embedder)
            .unwrap()
            .into_iter()
            .map(|r| r.metadata.citation_id)
            .collect();
        let expected: Vec<String> = semantic.iter().map(|i| index.entries[*i].metadata.citation_id.clone()).collect();
        assert_eq!(fused, expected);

        let keyword: Vec<String> = index
            .search_keyword(query, 10)
            .unwrap()
            .into_iter()
            .map(|r| r.metadata.citation_id)
            .collect();
        let fused: Vec<String> = index
            .search(query, 10, 0.0, &embedder)
            .unwrap()
            .into_iter()
            .map(|r| r.metadata.citation_id)
            .collect();
        assert_eq!(fused, keyword);
    }

    #[test]
    fn exact_identifier_is_found() {
        let embedder = HashingEmbedder::new(128);
        let index = HybridIndex::build(corpus(), &embedder, &RetrievalConfig::default()).unwrap();
        let hits = index.search("OBS.R01", 1, 0.5, &embedder).unwrap();
        assert_eq!(hits[0].metadata.citation_id, "p1_txt1");
        assert_eq!(hits[0].metadata.page, 1);
    }

    #[test]
    fn empty_index_is_an_error() {
        let embedder = HashingEmbedder::new(16);
        let index = HybridIndex::build(Vec::new(), &embedder, &RetrievalConfig::default()).unwrap();
        assert!(matches!(
            index.search("anything", 5, 0.5, &embedder),
            Err(RetrievalError::EmptyIndex)
        ));
    }

    #[test]
    fn query_dimension_must_match() {
        let index = HybridIndex::build(corpus(), &HashingEmbedder::new(32), &RetrievalConfig::default()).unwrap();
        assert!(matches!(
            index.search("glucose", 5, 0.5, &HashingEmbedder::new(64)),
            Err(RetrievalError::DimensionMismatch { expected: 32, actual: 64 })
        ));
    }

    #[test]
    fn saved_index_answers_the_same() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let embedder = HashingEmbedder::new(64);
        let index = HybridIndex::build(corpus(), &embedder, &RetrievalConfig::default()).unwrap();
        index.save(&path).unwrap();

        let loaded = HybridIndex::load(&path).unwrap();
        assert_eq!(loaded.embedder_name(), "hashing-64");
        assert_eq!(
            loaded.search("baud rate", 3, 0.5, &embedder).unwrap(),
            index.search("baud rate", 3, 0.5, &embedder).unwrap()
        );
    }
}
