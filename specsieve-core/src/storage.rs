use crate::error::ExtractionError;
use crate::types::DocumentArtifact;
use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Storage for raw extraction artifacts. Artifacts are written once and
/// never rewritten; every downstream stage reads them.
pub trait ArtifactStorage: Send + Sync {
    fn get_artifact(&self, document_id: &str) -> Result<Option<DocumentArtifact>>;
    fn store_artifact(&self, artifact: &DocumentArtifact) -> Result<PathBuf>;
}

/// One JSON file per document under `<data_dir>/artifacts/`
pub struct FileArtifactStore {
    artifacts_dir: PathBuf,
}

impl FileArtifactStore {
    pub fn new(artifacts_dir: impl Into<PathBuf>) -> Result<Self> {
        let artifacts_dir = artifacts_dir.into();
        fs::create_dir_all(&artifacts_dir)?;
        Ok(Self { artifacts_dir })
    }

    pub fn artifact_path(&self, document_id: &str) -> PathBuf {
        self.artifacts_dir.join(format!("{document_id}.json"))
    }

    pub fn exists(&self, document_id: &str) -> bool {
        self.artifact_path(document_id).exists()
    }
}

impl ArtifactStorage for FileArtifactStore {
    fn get_artifact(&self, document_id: &str) -> Result<Option<DocumentArtifact>> {
        let path = self.artifact_path(document_id);
        if !path.exists() {
            return Ok(None);
        }
        let json_str = fs::read_to_string(&path)?;
        let artifact: DocumentArtifact = serde_json::from_str(&json_str)
            .map_err(|e| anyhow!("Failed to deserialize artifact {}: {}", path.display(), e))?;
        Ok(Some(artifact))
    }

    fn store_artifact(&self, artifact: &DocumentArtifact) -> Result<PathBuf> {
        let path = self.artifact_path(&artifact.document_id);
        let json_str = serde_json::to_string_pretty(artifact)
            .map_err(|e| anyhow!("Failed to serialize artifact: {}", e))?;

        // create_new makes a concurrent second writer fail instead of clobbering
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ExtractionError::ArtifactExists(artifact.document_id.clone()).into());
            }
            Err(e) => return Err(ExtractionError::Io(e).into()),
        };
        file.write_all(json_str.as_bytes())?;
        file.sync_all()?;
        Ok(path)
    }
}

/// Document id: sha256 over the full source bytes
pub fn calculate_document_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn hash_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))?;
    Ok(calculate_document_hash(&bytes))
}
