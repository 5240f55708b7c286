// Specsieve Core Library
//
// Extraction, citation and correction pipeline for device specification PDFs.
// Raw extraction is written once; corrections are layered on top and every
// derived output is regenerated from the two.

pub mod citation;
pub mod classifier;
pub mod concurrency;
pub mod config;
pub mod corrections;
pub mod error;
pub mod generation;
pub mod geometry;
pub mod integrity;
pub mod ocr;
pub mod processor;
pub mod readers;
pub mod registry;
pub mod retrieval;
pub mod storage;
pub mod tables;
pub mod types;

// Re-export main types and functions for easy use
pub use types::*;
pub use classifier::PageClassifier;
pub use config::SpecsieveConfig;
pub use corrections::{regenerate, CorrectionRecord, CorrectionStore, ResolutionContext, Scope};
pub use error::{CacheError, CorrectionError, ExtractionError, OcrError, RetrievalError};
pub use generation::{CachedGenerator, CacheOutcome, CacheStatus};
pub use integrity::{verify_artifact, IntegrityReport};
pub use processor::{ExtractionPipeline, Regenerator, StepProfiler};
pub use readers::{MarkupReader, StructureReader};
pub use registry::{DeviceInfo, DeviceRegistry};
pub use retrieval::{HybridIndex, SearchResult};
pub use storage::{ArtifactStorage, FileArtifactStore};
