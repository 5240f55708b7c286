use crate::classifier::PageClassifier;
use crate::concurrency::{build_pool, FileLock, RenderPool};
use crate::config::{PathsConfig, SpecsieveConfig};
use crate::corrections::{regenerate, validate_owner, CorrectionStore, DerivedOutputs, ResolutionContext, ScopeConfig};
use crate::error::ExtractionError;
use crate::ocr::OcrEngine;
use crate::readers::StructureReader;
use crate::registry::DeviceRegistry;
use crate::retrieval::{EmbeddingModel, HybridIndex};
use crate::storage::{ArtifactStorage, FileArtifactStore};
use crate::types::*;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Collects timings for pipeline steps
pub struct StepProfiler {
    enabled: bool,
    timings: Vec<(String, Duration)>,
}

impl StepProfiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            timings: Vec::new(),
        }
    }

    pub fn time_step<F, R>(&mut self, step_name: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        if !self.enabled {
            return f();
        }

        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();

        self.timings.push((step_name.to_string(), elapsed));
        info!(step = step_name, ms = elapsed.as_millis() as u64, "Step finished");

        result
    }

    pub fn timings(&self) -> &[(String, Duration)] {
        &self.timings
    }

    pub fn log_summary(&self) {
        if !self.enabled || self.timings.is_empty() {
            return;
        }

        let total: Duration = self.timings.iter().map(|(_, d)| *d).sum();
        for (step, duration) in &self.timings {
            let percentage = if total.is_zero() {
                0.0
            } else {
                (duration.as_secs_f64() / total.as_secs_f64()) * 100.0
            };
            info!(
                step = %step,
                ms = duration.as_millis() as u64,
                percent = %format!("{percentage:.1}"),
                "Profile"
            );
        }
        info!(total_ms = total.as_millis() as u64, "Profile total");
    }
}

/// Page-parallel extraction of one document into a raw artifact
pub struct ExtractionPipeline {
    classifier: PageClassifier,
    ocr: Box<dyn OcrEngine>,
    storage: Box<dyn ArtifactStorage>,
    pages: ThreadPool,
    renders: RenderPool,
}

impl ExtractionPipeline {
    /// Create the pipeline with full dependency injection
    pub fn new_with_dependencies(
        ocr: Box<dyn OcrEngine>,
        storage: Box<dyn ArtifactStorage>,
        config: &SpecsieveConfig,
    ) -> Result<Self> {
        let extraction = &config.extraction;
        Ok(Self {
            classifier: PageClassifier::new(extraction)?,
            ocr,
            storage,
            pages: build_pool(extraction.workers, "page")?,
            renders: RenderPool::new(extraction.max_concurrent_renders)?,
        })
    }

    /// File-backed artifact storage under the configured data directory
    pub fn new_with_file_storage(ocr: Box<dyn OcrEngine>, config: &SpecsieveConfig) -> Result<Self> {
        let storage = FileArtifactStore::new(config.paths.artifacts_dir())?;
        Self::new_with_dependencies(ocr, Box::new(storage), config)
    }

    pub fn storage(&self) -> &dyn ArtifactStorage {
        self.storage.as_ref()
    }

    /// Extract every page. Failing pages are skipped and recorded; a document
    /// with no successful page is an error.
    pub fn extract(
        &self,
        reader: &dyn StructureReader,
        document_id: &str,
        source_path: &str,
        profiler: &mut StepProfiler,
    ) -> Result<DocumentArtifact> {
        if !reader.is_healthy() {
            return Err(ExtractionError::Reader(format!("{} is not healthy", reader.name())).into());
        }
        if !self.ocr.is_available() {
            warn!(engine = self.ocr.name(), "OCR engine unavailable, visual regions will yield no text");
        }

        let page_numbers: Vec<u32> = (1..=reader.page_count()).collect();
        info!(
            document = %short(document_id),
            pages = page_numbers.len(),
            workers = self.pages.current_num_threads(),
            reader = reader.name(),
            "Extracting document"
        );

        let results = profiler.time_step("Page extraction", || {
            self.pages.install(|| {
                page_numbers
                    .par_iter()
                    .map(|page| self.extract_page(reader, *page))
                    .collect::<Vec<_>>()
            })
        });

        let mut pages = Vec::new();
        let mut failed_pages = Vec::new();
        for (page, result) in page_numbers.iter().zip(results) {
            match result {
                Ok(bundle) => pages.push(bundle),
                Err(e) => {
                    warn!(page, error = %e, "Page skipped");
                    failed_pages.push(FailedPage {
                        page: *page,
                        message: format!("{e:#}"),
                    });
                }
            }
        }

        if pages.is_empty() {
            return Err(ExtractionError::NoPagesExtracted(source_path.to_string()).into());
        }

        let artifact = DocumentArtifact {
            document_id: document_id.to_string(),
            source_path: source_path.to_string(),
            page_count: reader.page_count(),
            pages,
            failed_pages,
            metadata: reader.metadata(),
            created_at: Utc::now(),
        };
        info!(
            document = %short(document_id),
            extracted = artifact.pages.len(),
            failed = artifact.failed_pages.len(),
            citations = artifact.citation_count(),
            ocr_results = artifact.ocr_result_count(),
            "Extraction finished"
        );
        Ok(artifact)
    }

    /// Extract and write the artifact once
    pub fn extract_and_store(
        &self,
        reader: &dyn StructureReader,
        document_id: &str,
        source_path: &str,
        enable_profiling: bool,
    ) -> Result<(DocumentArtifact, PathBuf)> {
        let mut profiler = StepProfiler::new(enable_profiling);
        let artifact = self.extract(reader, document_id, source_path, &mut profiler)?;
        let path = profiler.time_step("Artifact storage", || self.storage.store_artifact(&artifact))?;
        profiler.log_summary();
        Ok((artifact, path))
    }

    fn extract_page(&self, reader: &dyn StructureReader, page: u32) -> Result<PageBundle> {
        let raw = reader
            .read_page(page)
            .map_err(|e| ExtractionError::PageFailed {
                page,
                message: format!("{e:#}"),
            })?;
        if raw.page != page {
            return Err(ExtractionError::PageFailed {
                page,
                message: format!("reader returned page {} for page {}", raw.page, page),
            }
            .into());
        }
        Ok(self.classifier.classify(&raw, reader, self.ocr.as_ref(), &self.renders))
    }
}

/// Timestamped record of one regeneration pass, written beside the
/// timestamp-free outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegenerationRun {
    pub run_id: Uuid,
    pub device_id: String,
    pub document_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub corrections: usize,
    pub applied: usize,
    pub unmatched: usize,
    pub confirmed: usize,
    pub index_entries: usize,
    pub embedder: String,
    pub outputs_path: PathBuf,
    pub index_path: PathBuf,
}

/// Regenerates derived outputs and the retrieval index per device
pub struct Regenerator {
    corrections: Arc<CorrectionStore>,
    paths: PathsConfig,
    config: SpecsieveConfig,
}

impl Regenerator {
    pub fn new(corrections: Arc<CorrectionStore>, config: &SpecsieveConfig) -> Self {
        Self {
            corrections,
            paths: config.paths.clone(),
            config: config.clone(),
        }
    }

    pub fn outputs_path(&self, device_id: &str) -> PathBuf {
        self.paths.derived_dir(device_id).join("outputs.json")
    }

    pub fn run_path(&self, device_id: &str) -> PathBuf {
        self.paths.derived_dir(device_id).join("run.json")
    }

    pub fn index_path(&self, device_id: &str) -> PathBuf {
        self.paths.derived_dir(device_id).join("index.json")
    }

    /// Lock file held for a whole pass. Separate from the correction store's
    /// locks, which the snapshot takes inside the pass.
    pub fn pass_lock_path(&self, device_id: &str) -> PathBuf {
        self.paths
            .data_dir
            .join("derived")
            .join(".locks")
            .join(format!("{device_id}.lock"))
    }

    /// One synchronous pass for one device. Passes for the same device
    /// queue, across processes too; passes for different devices run
    /// independently.
    pub fn regenerate_device(
        &self,
        device_id: &str,
        registry: &DeviceRegistry,
        artifacts: &dyn ArtifactStorage,
        embedder: &dyn EmbeddingModel,
    ) -> Result<(DerivedOutputs, RegenerationRun)> {
        let started_at = Utc::now();
        validate_owner(device_id)?;
        let device = registry.get(device_id)?;
        let document_id = device
            .document_id
            .clone()
            .ok_or_else(|| anyhow!("device {} has no extracted document assigned", device_id))?;
        let artifact = artifacts
            .get_artifact(&document_id)?
            .ok_or_else(|| anyhow!("artifact {} for device {} not found", document_id, device_id))?;

        let _pass = FileLock::acquire(&self.pass_lock_path(device_id))
            .with_context(|| format!("Failed to lock regeneration for {}", device_id))?;

        let corrections = self.corrections.snapshot(device_id, Some(&device.vendor))?;
        let correction_count = corrections.len();
        let scope_config = ScopeConfig::load(&self.paths.scope_config_path())?;
        let ctx = ResolutionContext::new(device_id, Some(device.vendor.clone()), &scope_config, corrections)?;

        let outputs = regenerate(&artifact, &ctx);

        let derived_dir = self.paths.derived_dir(device_id);
        std::fs::create_dir_all(&derived_dir)
            .with_context(|| format!("Failed to create {}", derived_dir.display()))?;
        let outputs_path = self.outputs_path(device_id);
        std::fs::write(&outputs_path, outputs.to_canonical_json()?)
            .with_context(|| format!("Failed to write {}", outputs_path.display()))?;

        let index = HybridIndex::build(outputs.index_source.clone(), embedder, &self.config.retrieval)?;
        let index_path = self.index_path(device_id);
        index.save(&index_path)?;

        let run = RegenerationRun {
            run_id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            document_id,
            started_at,
            finished_at: Utc::now(),
            corrections: correction_count,
            applied: outputs.report.applied.len(),
            unmatched: outputs.report.unmatched.len(),
            confirmed: outputs.report.confirmed.len(),
            index_entries: index.len(),
            embedder: embedder.name(),
            outputs_path,
            index_path,
        };
        let run_path = self.run_path(device_id);
        std::fs::write(&run_path, serde_json::to_vec_pretty(&run)?)
            .with_context(|| format!("Failed to write {}", run_path.display()))?;

        info!(
            device = device_id,
            corrections = run.corrections,
            applied = run.applied,
            unmatched = run.unmatched,
            confirmed = run.confirmed,
            index_entries = run.index_entries,
            "Regeneration finished"
        );
        Ok((outputs, run))
    }

    /// Load the index a previous pass wrote for `device_id`
    pub fn load_index(&self, device_id: &str) -> Result<HybridIndex> {
        let path = self.index_path(device_id);
        HybridIndex::load(&path).with_context(|| format!("No index for device {}; run regenerate first", device_id))
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}
