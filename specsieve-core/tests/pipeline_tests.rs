//! End-to-end pipeline tests.
//!
//! Every external collaborator is a deterministic fake:
//!
//! - `FakeReader` serves hand-built pages and renders blank bitmaps
//! - `FakeOcr` answers every region with one fixed confidence and counts calls
//! - `CountingClient` stands in for the generation service
//!
//! No PDF tooling, OCR binary or network is needed to run these tests.

use specsieve_core::concurrency::FileLock;
use specsieve_core::config::SpecsieveConfig;
use specsieve_core::corrections::{CorrectionPayload, CorrectionRecord, CorrectionStore, Scope, ScopeConfig};
use specsieve_core::error::{CacheError, ExtractionError, OcrError};
use specsieve_core::generation::{
    CacheStatus, CacheStore, CachedGenerator, GenerationClient, MemoryCacheStore, NoOpLimiter,
};
use specsieve_core::ocr::{OcrEngine, OcrToken};
use specsieve_core::processor::{ExtractionPipeline, Regenerator};
use specsieve_core::readers::StructureReader;
use specsieve_core::registry::{DeviceInfo, DeviceRegistry};
use specsieve_core::retrieval::HashingEmbedder;
use specsieve_core::integrity::verify_artifact;
use specsieve_core::storage::{calculate_document_hash, ArtifactStorage, FileArtifactStore};
use specsieve_core::types::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Fakes and fixture helpers
// ============================================================================

fn bb(x0: f32, y0: f32, x1: f32, y1: f32) -> BoundingBox {
    BoundingBox::new(x0, y0, x1, y1)
}

fn text_block(text: &str, bbox: BoundingBox) -> RawTextBlock {
    RawTextBlock {
        bbox,
        spans: vec![RawSpan {
            text: text.to_string(),
            bbox,
        }],
    }
}

fn region(kind: RegionKind, bbox: BoundingBox) -> RawRegion {
    RawRegion {
        bbox,
        kind,
        image_ref: None,
    }
}

fn page(number: u32, text_blocks: Vec<RawTextBlock>, regions: Vec<RawRegion>) -> RawPage {
    RawPage {
        page: number,
        width: 612.0,
        height: 792.0,
        text_blocks,
        regions,
        table_candidates: vec![],
    }
}

struct FakeReader {
    pages: Vec<RawPage>,
    failing: BTreeSet<u32>,
}

impl FakeReader {
    fn new(pages: Vec<RawPage>) -> Self {
        Self {
            pages,
            failing: BTreeSet::new(),
        }
    }

    fn failing(mut self, page: u32) -> Self {
        self.failing.insert(page);
        self
    }
}

impl StructureReader for FakeReader {
    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    fn read_page(&self, page: u32) -> anyhow::Result<RawPage> {
        if self.failing.contains(&page) {
            anyhow::bail!("corrupt content stream on page {}", page);
        }
        self.pages
            .get(page as usize - 1)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no page {}", page))
    }

    fn render_region(&self, _page: u32, _bbox: &BoundingBox, dpi: u32) -> Result<Bitmap, OcrError> {
        Ok(Bitmap { png: vec![0u8; 16], dpi })
    }

    fn name(&self) -> &str {
        "fake"
    }
}

struct FakeOcr {
    confidence: f32,
    calls: AtomicUsize,
}

impl FakeOcr {
    fn new(confidence: f32) -> Self {
        Self {
            confidence,
            calls: AtomicUsize::new(0),
        }
    }
}

impl OcrEngine for FakeOcr {
    fn recognize(&self, _bitmap: &Bitmap, _language: &str) -> Result<Vec<OcrToken>, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            OcrToken::new("PIN", self.confidence),
            OcrToken::new("1", self.confidence),
        ])
    }

    fn name(&self) -> &str {
        "fake-ocr"
    }
}

/// Shares the call counter with the test after the engine is boxed
struct SharedOcr(Arc<FakeOcr>);

impl OcrEngine for SharedOcr {
    fn recognize(&self, bitmap: &Bitmap, language: &str) -> Result<Vec<OcrToken>, OcrError> {
        self.0.recognize(bitmap, language)
    }

    fn name(&self) -> &str {
        self.0.name()
    }
}

#[derive(Default)]
struct CountingClient {
    calls: AtomicUsize,
}

impl GenerationClient for CountingClient {
    fn generate(&self, model: &str, prompt: &str) -> Result<String, CacheError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{model}:{prompt}:{n}"))
    }
}

fn test_config(dir: &TempDir) -> SpecsieveConfig {
    let mut config = SpecsieveConfig::default();
    config.paths.data_dir = dir.path().join("data");
    config.paths.corrections_dir = dir.path().join("corrections");
    config.extraction.workers = 4;
    config.extraction.max_concurrent_renders = 2;
    config
}

fn pipeline(config: &SpecsieveConfig, confidence: f32) -> ExtractionPipeline {
    let storage = FileArtifactStore::new(config.paths.artifacts_dir()).unwrap();
    ExtractionPipeline::new_with_dependencies(Box::new(FakeOcr::new(confidence)), Box::new(storage), config).unwrap()
}

/// Page 1: one text block, one picture and 48 graphics regions laid out in a
/// grid below the text. Page 2: three text blocks and two graphics regions.
fn two_page_fixture() -> Vec<RawPage> {
    let mut page1_regions = vec![RawRegion {
        bbox: bb(400.0, 72.0, 540.0, 140.0),
        kind: RegionKind::Raster,
        image_ref: Some("logo.png".into()),
    }];
    for i in 0..48 {
        let col = (i % 8) as f32;
        let row = (i / 8) as f32;
        let x0 = 40.0 + col * 65.0;
        let y0 = 200.0 + row * 80.0;
        page1_regions.push(region(RegionKind::Vector, bb(x0, y0, x0 + 50.0, y0 + 60.0)));
    }
    let page1 = page(
        1,
        vec![text_block("Interface specification", bb(72.0, 72.0, 300.0, 90.0))],
        page1_regions,
    );

    let page2 = page(
        2,
        vec![
            text_block("Message OBS.R01 carries results", bb(72.0, 72.0, 400.0, 90.0)),
            text_block("Each result is one segment", bb(72.0, 120.0, 400.0, 138.0)),
            text_block("Figure 3 wiring", bb(72.0, 600.0, 300.0, 618.0)),
        ],
        vec![
            region(RegionKind::Vector, bb(72.0, 300.0, 250.0, 500.0)),
            region(RegionKind::Vector, bb(300.0, 300.0, 500.0, 500.0)),
        ],
    );
    vec![page1, page2]
}

// ============================================================================
// Geometry and citation ids
// ============================================================================

mod geometry_properties {
    use super::*;
    use specsieve_core::geometry::{overlaps, validate};

    fn boxes() -> Vec<BoundingBox> {
        let coords = [0.0, 5.0, 10.0, 15.0];
        let mut out = Vec::new();
        for &x0 in &coords {
            for &y0 in &coords {
                for &w in &[1.0, 5.0, 12.0] {
                    out.push(bb(x0, y0, x0 + w, y0 + w));
                }
            }
        }
        out
    }

    #[test]
    fn overlap_is_symmetric_and_reflexive() {
        let boxes = boxes();
        for a in &boxes {
            assert!(validate(a));
            assert!(overlaps(a, a));
            for b in &boxes {
                assert_eq!(overlaps(a, b), overlaps(b, a), "{a:?} vs {b:?}");
            }
        }
    }
}

mod citation_ids {
    use super::*;

    #[test]
    fn ids_are_unique_per_page_and_stable_across_runs() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let extractor = pipeline(&config, 0.95);
        let reader = FakeReader::new(two_page_fixture());
        let mut profiler = specsieve_core::StepProfiler::new(false);

        let first = extractor.extract(&reader, "doc", "fixture.pdf", &mut profiler).unwrap();
        let second = extractor.extract(&reader, "doc", "fixture.pdf", &mut profiler).unwrap();

        for bundle in &first.pages {
            let ids: Vec<&String> = bundle.blocks.iter().map(|b| &b.citation_id).collect();
            let unique: BTreeSet<&String> = ids.iter().copied().collect();
            assert_eq!(ids.len(), unique.len(), "duplicate ids on page {}", bundle.page);
        }
        assert_eq!(
            serde_json::to_value(&first.pages).unwrap(),
            serde_json::to_value(&second.pages).unwrap()
        );
    }
}

// ============================================================================
// Extraction: OCR gate and page isolation
// ============================================================================

mod extraction {
    use super::*;

    #[test]
    fn two_page_fixture_yields_50_and_5_citations() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let extractor = pipeline(&config, 0.3);
        let reader = FakeReader::new(two_page_fixture());

        let (artifact, path) = extractor
            .extract_and_store(&reader, "fixture-doc", "fixture.pdf", false)
            .unwrap();

        assert!(path.exists());
        assert_eq!(artifact.pages.len(), 2);
        assert_eq!(artifact.pages[0].citation_index.len(), 50);
        assert_eq!(artifact.pages[1].citation_index.len(), 5);
        assert_eq!(artifact.ocr_result_count(), 0);
        assert_eq!(artifact.pages[0].metadata.ocr.below_threshold, 49);
        assert_eq!(artifact.pages[0].metadata.graphics_blocks, 48);
    }

    #[test]
    fn artifact_is_written_once() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let extractor = pipeline(&config, 0.3);
        let reader = FakeReader::new(two_page_fixture());

        extractor.extract_and_store(&reader, "doc", "a.pdf", false).unwrap();
        let err = extractor.extract_and_store(&reader, "doc", "a.pdf", false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractionError>(),
            Some(ExtractionError::ArtifactExists(_))
        ));
        assert!(extractor.storage().get_artifact("doc").unwrap().is_some());
    }

    #[test]
    fn region_over_text_is_never_ocred() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let engine = Arc::new(FakeOcr::new(0.95));
        let storage = FileArtifactStore::new(config.paths.artifacts_dir()).unwrap();
        let extractor =
            ExtractionPipeline::new_with_dependencies(Box::new(SharedOcr(engine.clone())), Box::new(storage), &config)
                .unwrap();

        let reader = FakeReader::new(vec![page(
            1,
            vec![text_block("Pin assignment", bb(100.0, 100.0, 200.0, 120.0))],
            vec![region(RegionKind::Raster, bb(90.0, 90.0, 210.0, 130.0))],
        )]);
        let mut profiler = specsieve_core::StepProfiler::new(false);
        let artifact = extractor.extract(&reader, "doc", "a.pdf", &mut profiler).unwrap();

        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert_eq!(artifact.ocr_result_count(), 0);
        assert_eq!(artifact.pages[0].metadata.ocr.skipped_text_overlap, 1);
    }

    #[test]
    fn confidence_threshold_decides_storage() {
        let fixture = || {
            FakeReader::new(vec![page(
                1,
                vec![text_block("Figure 1 connector", bb(72.0, 400.0, 300.0, 420.0))],
                vec![region(RegionKind::Raster, bb(72.0, 100.0, 300.0, 300.0))],
            )])
        };
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let mut profiler = specsieve_core::StepProfiler::new(false);

        let accepted = pipeline(&config, 0.7)
            .extract(&fixture(), "doc", "a.pdf", &mut profiler)
            .unwrap();
        assert_eq!(accepted.ocr_result_count(), 1);
        let ocr = &accepted.pages[0].ocr_results[0];
        assert_eq!(ocr.citation_id, "p1_ocr1");
        assert_eq!(ocr.text, "PIN 1");
        assert_eq!(ocr.associated_block_citation_id.as_deref(), Some("p1_txt1"));

        let rejected = pipeline(&config, 0.69)
            .extract(&fixture(), "doc", "a.pdf", &mut profiler)
            .unwrap();
        assert_eq!(rejected.ocr_result_count(), 0);
        assert!(rejected.pages[0].citation("p1_ocr1").is_none());
    }

    #[test]
    fn failing_page_is_skipped() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let reader = FakeReader::new(two_page_fixture()).failing(1);
        let mut profiler = specsieve_core::StepProfiler::new(false);

        let artifact = pipeline(&config, 0.3).extract(&reader, "doc", "a.pdf", &mut profiler).unwrap();
        assert_eq!(artifact.pages.len(), 1);
        assert_eq!(artifact.pages[0].page, 2);
        assert_eq!(artifact.failed_pages.len(), 1);
        assert_eq!(artifact.failed_pages[0].page, 1);
    }

    #[test]
    fn zero_pages_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let reader = FakeReader::new(two_page_fixture()).failing(1).failing(2);
        let mut profiler = specsieve_core::StepProfiler::new(false);

        let err = pipeline(&config, 0.3)
            .extract(&reader, "doc", "a.pdf", &mut profiler)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractionError>(),
            Some(ExtractionError::NoPagesExtracted(_))
        ));
    }

    #[test]
    fn stored_artifact_passes_integrity_until_tampered() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let source = dir.path().join("fixture.pdf");
        std::fs::write(&source, b"%PDF-1.7 fixture").unwrap();
        let document_id = calculate_document_hash(b"%PDF-1.7 fixture");

        let reader = FakeReader::new(two_page_fixture()).failing(2);
        let source_str = source.display().to_string();
        pipeline(&config, 0.9)
            .extract_and_store(&reader, &document_id, &source_str, false)
            .unwrap();

        let storage = FileArtifactStore::new(config.paths.artifacts_dir()).unwrap();
        let mut artifact = storage.get_artifact(&document_id).unwrap().unwrap();
        let report = verify_artifact(&artifact, None);
        assert!(report.is_intact(), "{:?}", report.issues);
        assert_eq!(report.citations.indexed, artifact.citation_count());

        // Drop a citation from the index and forget the failed page
        let dropped = artifact.pages[0].blocks[0].citation_id.clone();
        artifact.pages[0].citation_index.remove(&dropped);
        artifact.failed_pages.clear();
        let report = verify_artifact(&artifact, Some(&source));
        assert!(report.source.verified);
        assert_eq!(report.pages.missing, vec![2]);
        assert_eq!(report.citations.dangling, vec![dropped]);
        assert!(!report.is_intact());
    }
}

// ============================================================================
// Corrections and regeneration
// ============================================================================

mod regeneration {
    use super::*;

    struct Setup {
        _dir: TempDir,
        config: SpecsieveConfig,
        registry: DeviceRegistry,
        store: Arc<CorrectionStore>,
        artifacts: FileArtifactStore,
    }

    fn setup(pages: Vec<RawPage>) -> Setup {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let extractor = pipeline(&config, 0.3);
        extractor
            .extract_and_store(&FakeReader::new(pages), "doc-1", "spec.pdf", false)
            .unwrap();

        let mut registry = DeviceRegistry::default();
        for (device, vendor) in [("analyzer-1", "acme"), ("analyzer-2", "globex")] {
            registry.register(
                device,
                DeviceInfo {
                    vendor: vendor.to_string(),
                    model: "X".to_string(),
                    spec_version: "1.0".to_string(),
                    document_id: Some("doc-1".to_string()),
                },
            );
        }

        Setup {
            store: Arc::new(CorrectionStore::new(&config.paths.corrections_dir).unwrap()),
            artifacts: FileArtifactStore::new(config.paths.artifacts_dir()).unwrap(),
            registry,
            config,
            _dir: dir,
        }
    }

    fn single_text(text: &str) -> Vec<RawPage> {
        vec![page(1, vec![text_block(text, bb(72.0, 72.0, 400.0, 90.0))], vec![])]
    }

    #[test]
    fn global_zero_fix_reaches_the_keyword_index() {
        let s = setup(single_text("0BS.R01 result"));
        s.store
            .append(&CorrectionRecord::new(
                Scope::Global,
                None,
                CorrectionPayload::TextReplacement {
                    citation_id: None,
                    original: "0BS".into(),
                    corrected: "OBS".into(),
                },
                "OCR reads O as zero",
            ))
            .unwrap();

        let regenerator = Regenerator::new(s.store.clone(), &s.config);
        let embedder = HashingEmbedder::new(64);
        let (outputs, run) = regenerator
            .regenerate_device("analyzer-1", &s.registry, &s.artifacts, &embedder)
            .unwrap();

        assert_eq!(outputs.blocks["p1_txt1"].text, "OBS.R01 result");
        assert!(outputs.pages[0].markdown.starts_with("OBS.R01 result [^p1_txt1]"));
        assert!(run.outputs_path.exists());

        let index = regenerator.load_index("analyzer-1").unwrap();
        let hits = index.search_keyword("OBS.R01", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.citation_id, "p1_txt1");
        assert_eq!(hits[0].metadata.page, 1);
        assert_eq!(hits[0].metadata.document_id, "doc-1");
        assert!(index.search_keyword("0BS.R01", 5).unwrap().is_empty());
    }

    #[test]
    fn regeneration_is_byte_identical() {
        let s = setup(single_text("0BS.R01 result for ORU.R01"));
        s.store
            .append(&CorrectionRecord::new(
                Scope::Device,
                Some("analyzer-1".into()),
                CorrectionPayload::TextReplacement {
                    citation_id: Some("p1_txt1".into()),
                    original: "0BS".into(),
                    corrected: "OBS".into(),
                },
                "typo",
            ))
            .unwrap();

        let regenerator = Regenerator::new(s.store.clone(), &s.config);
        let embedder = HashingEmbedder::new(64);
        regenerator
            .regenerate_device("analyzer-1", &s.registry, &s.artifacts, &embedder)
            .unwrap();
        let first = std::fs::read(regenerator.outputs_path("analyzer-1")).unwrap();
        regenerator
            .regenerate_device("analyzer-1", &s.registry, &s.artifacts, &embedder)
            .unwrap();
        let second = std::fs::read(regenerator.outputs_path("analyzer-1")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn vendor_category_beats_standard() {
        let s = setup(single_text("OBS.R01 result"));
        let scope = ScopeConfig {
            standard: [("OBS".to_string(), "observation".to_string())].into(),
            ..Default::default()
        };
        scope.save(&s.config.paths.scope_config_path()).unwrap();
        s.store
            .append(&CorrectionRecord::new(
                Scope::Vendor,
                Some("acme".into()),
                CorrectionPayload::CategoryOverride {
                    prefix: "OBS".into(),
                    category: "acme-result".into(),
                },
                "vendor naming",
            ))
            .unwrap();

        let regenerator = Regenerator::new(s.store.clone(), &s.config);
        let embedder = HashingEmbedder::new(32);

        let (acme, _) = regenerator
            .regenerate_device("analyzer-1", &s.registry, &s.artifacts, &embedder)
            .unwrap();
        assert_eq!(acme.entities["OBS.R01"].category.category.as_deref(), Some("acme-result"));

        // Other vendors still fall through to the standard map
        let (globex, _) = regenerator
            .regenerate_device("analyzer-2", &s.registry, &s.artifacts, &embedder)
            .unwrap();
        assert_eq!(globex.entities["OBS.R01"].category.category.as_deref(), Some("observation"));
    }

    #[test]
    fn unknown_citation_is_reported_not_fatal() {
        let s = setup(single_text("OBS.R01 result"));
        s.store
            .append(&CorrectionRecord::new(
                Scope::Device,
                Some("analyzer-1".into()),
                CorrectionPayload::Confirmation {
                    citation_id: "p9_txt9".into(),
                },
                "checked",
            ))
            .unwrap();

        let regenerator = Regenerator::new(s.store.clone(), &s.config);
        let (outputs, run) = regenerator
            .regenerate_device("analyzer-1", &s.registry, &s.artifacts, &HashingEmbedder::new(32))
            .unwrap();
        assert_eq!(run.unmatched, 1);
        assert_eq!(outputs.report.unmatched[0].target_key, "p9_txt9");
        assert_eq!(outputs.blocks["p1_txt1"].text, "OBS.R01 result");
    }

    #[test]
    fn pass_waits_for_a_held_device_lock() {
        let s = setup(single_text("OBS.R01 result"));
        let regenerator = Regenerator::new(s.store.clone(), &s.config);
        let embedder = HashingEmbedder::new(32);
        let held = FileLock::acquire(&regenerator.pass_lock_path("analyzer-1")).unwrap();

        std::thread::scope(|scope| {
            let pass = scope.spawn(|| {
                regenerator
                    .regenerate_device("analyzer-1", &s.registry, &s.artifacts, &embedder)
                    .map(|(_, run)| run.device_id)
            });
            // Another device is not blocked meanwhile
            regenerator
                .regenerate_device("analyzer-2", &s.registry, &s.artifacts, &embedder)
                .unwrap();
            assert!(!pass.is_finished());
            assert!(!regenerator.outputs_path("analyzer-1").exists());

            drop(held);
            assert_eq!(pass.join().unwrap().unwrap(), "analyzer-1");
        });
        assert!(regenerator.outputs_path("analyzer-1").exists());
    }

    #[test]
    fn unknown_device_is_missing() {
        let s = setup(single_text("text"));
        let regenerator = Regenerator::new(s.store.clone(), &s.config);
        let err = regenerator
            .regenerate_device("nope", &s.registry, &s.artifacts, &HashingEmbedder::new(32))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<specsieve_core::CorrectionError>(),
            Some(specsieve_core::CorrectionError::MissingDevice(_))
        ));
    }
}

// ============================================================================
// Generation cache
// ============================================================================

mod generation_cache {
    use super::*;

    #[test]
    fn verified_entry_is_served_without_calling_out() {
        let client = Arc::new(CountingClient::default());
        let cached_gen = CachedGenerator::new(Arc::new(MemoryCacheStore::new()), client.clone(), Box::new(NoOpLimiter));

        let miss = cached_gen.lookup("llama3.1", "describe OBS.R01", false).unwrap();
        assert_eq!(miss.status, CacheStatus::Miss);
        cached_gen.verify(&miss.prompt_hash, Some("X")).unwrap();
        let calls_after_verify = client.calls.load(Ordering::SeqCst);

        let hit = cached_gen.lookup("llama3.1", "describe OBS.R01", true).unwrap();
        assert_eq!(hit.text, "X");
        assert_eq!(hit.status, CacheStatus::Hit);
        assert!(hit.verified);
        assert_eq!(client.calls.load(Ordering::SeqCst), calls_after_verify);
    }

    #[test]
    fn hit_count_grows_by_one_per_lookup() {
        let store = Arc::new(MemoryCacheStore::new());
        let client = Arc::new(CountingClient::default());
        let cached_gen = CachedGenerator::new(store.clone(), client.clone(), Box::new(NoOpLimiter));

        let miss = cached_gen.lookup("m", "p", false).unwrap();
        cached_gen.verify(&miss.prompt_hash, None).unwrap();
        for expected in 1..=5u64 {
            cached_gen.lookup("m", "p", true).unwrap();
            let entry = cached_gen.store().get(&miss.prompt_hash).unwrap().unwrap();
            assert_eq!(entry.hit_count, expected);
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }
}
