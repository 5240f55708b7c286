use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_dpi() -> u32 {
    300
}

fn default_ocr_threshold() -> f32 {
    0.7
}

fn default_row_tolerance() -> f32 {
    5.0
}

fn default_column_gap_floor() -> f32 {
    20.0
}

fn default_column_gap_multiplier() -> f32 {
    1.5
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_concurrent_renders() -> usize {
    2
}

fn default_caption_patterns() -> Vec<String> {
    vec![
        r"(?i)\bfig(?:ure)?\.?\s*\d+".to_string(), // Figure 3, Fig. 3
        r"(?i)\btable\s+\d+".to_string(),
        r"(?i)\bdiagram\s+\d+".to_string(),
        r"(?i)\bchart\s+\d+".to_string(),
    ]
}

fn default_ocr_language() -> String {
    "eng".to_string()
}

fn default_min_table_rows() -> usize {
    2
}

fn default_min_table_cols() -> usize {
    2
}

fn default_model() -> String {
    "llama3.1".to_string()
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("data/llm_cache.db")
}

fn default_alpha() -> f32 {
    0.5
}

fn default_top_k() -> usize {
    5
}

fn default_rrf_k() -> f32 {
    60.0
}

fn default_bm25_k1() -> f32 {
    1.5
}

fn default_bm25_b() -> f32 {
    0.75
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_corrections_dir() -> PathBuf {
    PathBuf::from("data/corrections")
}

/// Top-level configuration, loaded from YAML.
/// Every field has a default, so partial files are fine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecsieveConfig {
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Render resolution for OCR regions
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    /// Minimum mean token confidence for an OCR result to be stored (0.0-1.0)
    #[serde(default = "default_ocr_threshold")]
    pub ocr_confidence_threshold: f32,
    /// Vertical tolerance in points for grouping spans into table rows
    #[serde(default = "default_row_tolerance")]
    pub row_tolerance: f32,
    /// Smallest horizontal gap in points that may separate two columns
    #[serde(default = "default_column_gap_floor")]
    pub column_gap_floor: f32,
    /// A gap wider than this multiple of the average gap starts a new column
    #[serde(default = "default_column_gap_multiplier")]
    pub column_gap_multiplier: f32,
    #[serde(default = "default_min_table_rows")]
    pub min_table_rows: usize,
    #[serde(default = "default_min_table_cols")]
    pub min_table_cols: usize,
    /// Whether to run the free-text table sweep at all
    #[serde(default = "default_true")]
    pub table_sweep: bool,
    /// Pages extracted in parallel
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Upper bound on bitmaps rendered at the same time, across all pages
    #[serde(default = "default_max_concurrent_renders")]
    pub max_concurrent_renders: usize,
    /// Regexes marking a text block as a figure/table caption
    #[serde(default = "default_caption_patterns")]
    pub caption_patterns: Vec<String>,
    #[serde(default = "default_ocr_language")]
    pub ocr_language: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            dpi: default_dpi(),
            ocr_confidence_threshold: default_ocr_threshold(),
            row_tolerance: default_row_tolerance(),
            column_gap_floor: default_column_gap_floor(),
            column_gap_multiplier: default_column_gap_multiplier(),
            min_table_rows: default_min_table_rows(),
            min_table_cols: default_min_table_cols(),
            table_sweep: true,
            workers: default_workers(),
            max_concurrent_renders: default_max_concurrent_renders(),
            caption_patterns: default_caption_patterns(),
            ocr_language: default_ocr_language(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Only remote providers are ever throttled
    pub enabled: bool,
    pub capacity: u32,
    pub refill_per_sec: f64,
    /// How long a caller may block waiting for a token
    pub acquire_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 10,
            refill_per_sec: 1.0,
            acquire_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationProvider {
    /// Local Ollama server
    #[default]
    Ollama,
    /// Hosted OpenAI-compatible chat completions API
    OpenAi,
}

impl GenerationProvider {
    pub fn is_remote(self) -> bool {
        matches!(self, Self::OpenAi)
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    4000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub provider: GenerationProvider,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Sampling is pinned so identical prompts stay response-stable
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding the remote provider's API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Let best-effort callers generate directly when the cache store is down
    #[serde(default)]
    pub allow_uncached_fallback: bool,
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: GenerationProvider::default(),
            model: default_model(),
            base_url: default_base_url(),
            temperature: 0.0,
            seed: default_seed(),
            timeout_secs: default_timeout_secs(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            rate_limit: RateLimitConfig::default(),
            allow_uncached_fallback: false,
            cache_path: default_cache_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    /// Offline feature-hashing embedder
    Hashing,
    /// Embeddings endpoint of the generation service
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Weight of the semantic ranking in hybrid fusion (0.0-1.0)
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Reciprocal-rank-fusion damping constant
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f32,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f32,
    #[serde(default = "default_embedder")]
    pub embedder: EmbedderKind,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
}

fn default_embedder() -> EmbedderKind {
    EmbedderKind::Hashing
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            top_k: default_top_k(),
            rrf_k: default_rrf_k(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            embedder: default_embedder(),
            embedding_model: default_embedding_model(),
            embedding_dimension: default_embedding_dimension(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Artifacts, derived outputs, registry and indices live under here
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_corrections_dir")]
    pub corrections_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            corrections_dir: default_corrections_dir(),
        }
    }
}

impl PathsConfig {
    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn derived_dir(&self, device_id: &str) -> PathBuf {
        self.data_dir.join("derived").join(device_id)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.yaml")
    }

    pub fn scope_config_path(&self) -> PathBuf {
        self.corrections_dir.join("scope_config.yaml")
    }
}

impl SpecsieveConfig {
    /// Load config from file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SpecsieveConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load config with fallback to default
    pub fn load_with_fallback(path: Option<&str>) -> Self {
        match path {
            Some(p) => Self::load_from_file(p).unwrap_or_else(|e| {
                warn!(path = p, error = %e, "Failed to load config, using defaults");
                Self::default()
            }),
            None => Self::default(),
        }
    }
}
