use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use specsieve::{exit_code, init_logging, EXIT_OK};
use specsieve_core::corrections::{validate_owner, CorrectionFilter, CorrectionKind, CorrectionPayload, CorrectionRecord, CorrectionStore, Scope};
use specsieve_core::error::{CorrectionError, ExtractionError};
use specsieve_core::generation::{
    client_for, limiter_for, CacheStore, CachedGenerator, LookupContext, SqliteCacheStore, UnavailableStore,
};
use specsieve_core::ocr::TesseractEngine;
use specsieve_core::processor::{ExtractionPipeline, Regenerator};
use specsieve_core::readers::{MarkupReader, PopplerRasterizer};
use specsieve_core::registry::{DeviceInfo, DeviceRegistry};
use specsieve_core::retrieval::embedder_from_config;
use specsieve_core::integrity::verify_artifact;
use specsieve_core::storage::{calculate_document_hash, ArtifactStorage, FileArtifactStore};
use specsieve_core::SpecsieveConfig;

#[derive(Parser)]
#[command(name = "specsieve")]
#[command(about = "Extract, cite and correct device specification PDFs")]
struct Args {
    /// Path to custom config file (YAML format)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log progress at info level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract a document into a write-once raw artifact
    Extract {
        /// Page-structured markup produced from the PDF
        #[arg(short, long)]
        markup: PathBuf,

        /// Source PDF, used for region rendering and the document id
        #[arg(short, long)]
        pdf: Option<PathBuf>,

        /// Assign the artifact to this registered device
        #[arg(short, long)]
        device: Option<String>,

        /// Enable detailed profiling of all pipeline steps
        #[arg(long)]
        profile: bool,
    },

    /// Add or update a device in the registry
    RegisterDevice {
        device: String,
        #[arg(long)]
        vendor: String,
        #[arg(long, default_value = "")]
        model: String,
        #[arg(long, default_value = "")]
        spec_version: String,
    },

    /// Append one correction record
    AddCorrection {
        /// device, vendor, standard or global
        #[arg(short, long)]
        scope: String,

        /// Owning device (device scope)
        #[arg(short, long)]
        device: Option<String>,

        /// Owning vendor (vendor scope)
        #[arg(long)]
        vendor: Option<String>,

        /// JSON payload tagged by kind, e.g.
        /// {"kind":"text_replacement","citation_id":"p1_txt1","original":"0BS","corrected":"OBS"}
        #[arg(short, long)]
        payload: String,

        #[arg(short, long, default_value = "")]
        reason: String,
    },

    /// Recompute derived outputs and the retrieval index for a device
    Regenerate { device: String },

    /// List correction records
    ListCorrections {
        #[arg(short, long)]
        device: Option<String>,
        #[arg(short, long)]
        kind: Option<String>,
        #[arg(short, long)]
        scope: Option<String>,
    },

    /// Generate through the verification-gated cache
    Generate {
        #[arg(short, long)]
        prompt: Option<String>,

        /// Read the prompt from a file instead
        #[arg(long, conflicts_with = "prompt")]
        prompt_file: Option<PathBuf>,

        /// Overrides the configured model
        #[arg(short, long)]
        model: Option<String>,

        /// Only return human-verified responses from the cache
        #[arg(long)]
        verified_only: bool,

        #[arg(long)]
        device: Option<String>,

        #[arg(long)]
        message_type: Option<String>,
    },

    /// Mark a cache entry as human-verified, optionally correcting it
    Verify {
        hash: String,
        #[arg(long)]
        corrected: Option<String>,
    },

    /// Unverified cache entries awaiting review
    Pending {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Cache totals
    CacheStats,

    /// Check a raw artifact against its source and its own citation index
    VerifyArtifact {
        document_id: String,

        /// Source PDF, if it moved since extraction
        #[arg(short, long)]
        source: Option<PathBuf>,
    },

    /// Query a device's hybrid retrieval index
    Search {
        device: String,
        query: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Semantic weight, 0.0 (keyword only) to 1.0 (semantic only)
        #[arg(short, long)]
        alpha: Option<f32>,
    },
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = SpecsieveConfig::load_with_fallback(args.config.as_deref());
    match run(args.command, &config) {
        Ok(()) => std::process::exit(EXIT_OK),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(exit_code(&e));
        }
    }
}

fn run(command: Command, config: &SpecsieveConfig) -> Result<()> {
    match command {
        Command::Extract {
            markup,
            pdf,
            device,
            profile,
        } => extract(config, &markup, pdf.as_deref(), device.as_deref(), profile),
        Command::RegisterDevice {
            device,
            vendor,
            model,
            spec_version,
        } => {
            validate_owner(&device)?;
            validate_owner(&vendor)?;
            let path = config.paths.registry_path();
            let mut registry = DeviceRegistry::load(&path)?;
            let document_id = registry.get(&device).ok().and_then(|d| d.document_id.clone());
            registry.register(
                &device,
                DeviceInfo {
                    vendor,
                    model,
                    spec_version,
                    document_id,
                },
            );
            registry.save(&path)?;
            info!(device = %device, "Registered device");
            Ok(())
        }
        Command::AddCorrection {
            scope,
            device,
            vendor,
            payload,
            reason,
        } => add_correction(config, &scope, device, vendor, &payload, &reason),
        Command::Regenerate { device } => {
            let registry = DeviceRegistry::load(&config.paths.registry_path())?;
            let store = Arc::new(CorrectionStore::new(&config.paths.corrections_dir)?);
            let artifacts = FileArtifactStore::new(config.paths.artifacts_dir())?;
            let embedder = embedder_from_config(&config.retrieval, &config.generation);
            let regenerator = Regenerator::new(store, config);
            let (_, run) = regenerator.regenerate_device(&device, &registry, &artifacts, embedder.as_ref())?;
            print_json(&run)
        }
        Command::ListCorrections { device, kind, scope } => {
            let filter = CorrectionFilter {
                device,
                kind: kind.as_deref().map(str::parse::<CorrectionKind>).transpose()?,
                scope: scope.as_deref().map(str::parse::<Scope>).transpose()?,
            };
            let store = CorrectionStore::new(&config.paths.corrections_dir)?;
            let records = store.list(&filter)?;
            for record in &records {
                println!("{}", serde_json::to_string(record)?);
            }
            Ok(())
        }
        Command::Generate {
            prompt,
            prompt_file,
            model,
            verified_only,
            device,
            message_type,
        } => {
            let prompt = match (prompt, prompt_file) {
                (Some(p), _) => p,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read prompt from {}", path.display()))?,
                (None, None) => anyhow::bail!("either --prompt or --prompt-file is required"),
            };
            let model = model.unwrap_or_else(|| config.generation.model.clone());
            let context = LookupContext {
                device_id: device,
                message_type,
            };
            let outcome = cached_generator(config).lookup_with_context(&model, &prompt, verified_only, &context)?;
            print_json(&outcome)
        }
        Command::Verify { hash, corrected } => {
            let entry = cached_generator(config).verify(&hash, corrected.as_deref())?;
            print_json(&entry)
        }
        Command::Pending { limit } => {
            let entries = cached_generator(config).pending_review(limit)?;
            print_json(&entries)
        }
        Command::CacheStats => print_json(&cached_generator(config).stats()?),
        Command::VerifyArtifact { document_id, source } => verify_artifact_cmd(config, &document_id, source.as_deref()),
        Command::Search {
            device,
            query,
            top_k,
            alpha,
        } => {
            let store = Arc::new(CorrectionStore::new(&config.paths.corrections_dir)?);
            let regenerator = Regenerator::new(store, config);
            let index = regenerator.load_index(&device)?;
            let embedder = embedder_from_config(&config.retrieval, &config.generation);
            let results = index.search(
                &query,
                top_k.unwrap_or(config.retrieval.top_k),
                alpha.unwrap_or(config.retrieval.alpha),
                embedder.as_ref(),
            )?;
            print_json(&results)
        }
    }
}

fn extract(
    config: &SpecsieveConfig,
    markup: &Path,
    pdf: Option<&Path>,
    device: Option<&str>,
    profile: bool,
) -> Result<()> {
    // Fail on an unknown device before doing any work
    let registry_path = config.paths.registry_path();
    let mut registry = DeviceRegistry::load(&registry_path)?;
    if let Some(device) = device {
        registry.get(device)?;
    }

    let mut reader = MarkupReader::from_file(markup)?;
    let source = match pdf {
        Some(pdf) => {
            reader = reader.with_renderer(Box::new(PopplerRasterizer::new(pdf)));
            pdf
        }
        None => {
            warn!("No PDF given, visual regions cannot be rendered for OCR");
            markup
        }
    };
    let bytes = std::fs::read(source).with_context(|| format!("Failed to read {}", source.display()))?;
    let document_id = calculate_document_hash(&bytes);

    let pipeline = ExtractionPipeline::new_with_file_storage(Box::new(TesseractEngine::new()), config)?;
    let (artifact, path) = pipeline.extract_and_store(&reader, &document_id, &source.display().to_string(), profile)?;

    if let Some(device) = device {
        registry.assign_document(device, &document_id)?;
        registry.save(&registry_path)?;
    }

    print_json(&serde_json::json!({
        "document_id": artifact.document_id,
        "artifact": path,
        "pages": artifact.pages.len(),
        "failed_pages": artifact.failed_pages,
        "citations": artifact.citation_count(),
        "ocr_results": artifact.ocr_result_count(),
    }))
}

fn add_correction(
    config: &SpecsieveConfig,
    scope: &str,
    device: Option<String>,
    vendor: Option<String>,
    payload: &str,
    reason: &str,
) -> Result<()> {
    let scope: Scope = scope.parse()?;
    let payload: CorrectionPayload = serde_json::from_str(payload)
        .map_err(|e| CorrectionError::EmptyPayload(format!("invalid payload: {e}")))?;

    let owner = match scope {
        Scope::Device => {
            let device = device.ok_or_else(|| CorrectionError::MissingOwner {
                scope: scope.to_string(),
                what: "--device".to_string(),
            })?;
            DeviceRegistry::load(&config.paths.registry_path())?.get(&device)?;
            Some(device)
        }
        Scope::Vendor => {
            let vendor = vendor.ok_or_else(|| CorrectionError::MissingOwner {
                scope: scope.to_string(),
                what: "--vendor".to_string(),
            })?;
            DeviceRegistry::load(&config.paths.registry_path())?.require_vendor(&vendor)?;
            Some(vendor)
        }
        Scope::Standard | Scope::Global => None,
    };

    let record = CorrectionRecord::new(scope, owner, payload, reason);
    let store = CorrectionStore::new(&config.paths.corrections_dir)?;
    let path = store.append(&record)?;
    info!(path = %path.display(), "Correction recorded");
    println!("{}", serde_json::to_string(&record)?);
    Ok(())
}

/// Prints the report either way; a failed check exits non-zero
fn verify_artifact_cmd(config: &SpecsieveConfig, document_id: &str, source: Option<&Path>) -> Result<()> {
    let artifacts = FileArtifactStore::new(config.paths.artifacts_dir())?;
    let artifact = artifacts
        .get_artifact(document_id)?
        .with_context(|| format!("No artifact {document_id}"))?;
    let report = verify_artifact(&artifact, source);
    print_json(&report)?;
    if report.is_intact() {
        Ok(())
    } else {
        Err(ExtractionError::IntegrityFailed {
            document_id: document_id.to_string(),
            issues: report.issues.len(),
        }
        .into())
    }
}

/// Cache store failures are left to the generator, which decides per call
/// whether they are fatal
fn cached_generator(config: &SpecsieveConfig) -> CachedGenerator {
    let generation = &config.generation;
    let store: Arc<dyn CacheStore> = match SqliteCacheStore::open(&generation.cache_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(path = %generation.cache_path.display(), error = %e, "Cache store unavailable");
            Arc::new(UnavailableStore::new(e.to_string()))
        }
    };
    CachedGenerator::new(
        store,
        client_for(generation),
        limiter_for(generation),
    )
    .with_uncached_fallback(generation.allow_uncached_fallback)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
