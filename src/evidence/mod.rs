//! Evidence retrieval.
//!
//! An evidence artifact is fetched into local temporary storage, its content
//! is read as text or image bytes, and the local copy is removed afterwards.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Errors raised while fetching or reading evidence.
#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    #[error("evidence not found: {0}")]
    NotFound(String),
    #[error("failed to download evidence {path}: {source}")]
    Download {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read evidence {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("evidence {0} is empty or not readable as text")]
    Unreadable(String),
}

/// Identifies an evidence artifact to analyze.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceRef {
    pub id: String,
    /// Display name, usually the file name.
    pub name: String,
    /// Source location of the artifact.
    pub location: PathBuf,
}

impl EvidenceRef {
    /// Build a reference from a file path, using the file name as id and name.
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        Self {
            id: name.clone(),
            name,
            location: path.to_path_buf(),
        }
    }
}

/// Content handed to the analysis engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EvidenceContent {
    Text(String),
    Image { data: Vec<u8>, media_type: String },
}

impl EvidenceContent {
    /// Leading characters of text evidence; empty for images.
    pub fn excerpt(&self, max_chars: usize) -> String {
        match self {
            EvidenceContent::Text(text) => text.chars().take(max_chars).collect(),
            EvidenceContent::Image { .. } => String::new(),
        }
    }
}

/// Local copy of a downloaded artifact.
///
/// Dropping the handle removes the temporary directory as well; `cleanup`
/// makes the removal explicit and logged.
#[derive(Debug)]
pub struct LocalEvidence {
    pub path: PathBuf,
    temp_dir: Option<TempDir>,
}

impl LocalEvidence {
    /// Wrap a path that is not owned by a temporary directory.
    #[allow(dead_code)] // For sources that read artifacts in place
    pub fn borrowed(path: PathBuf) -> Self {
        Self {
            path,
            temp_dir: None,
        }
    }
}

/// Boundary to wherever evidence artifacts live.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Fetch the artifact into local storage.
    async fn download(&self, evidence: &EvidenceRef) -> Result<LocalEvidence, EvidenceError>;

    /// Read the content of a downloaded artifact.
    async fn extract(&self, local: &LocalEvidence) -> Result<EvidenceContent, EvidenceError> {
        read_content(&local.path).await
    }

    /// Release local storage held by `local`.
    async fn cleanup(&self, local: LocalEvidence);
}

/// Document source backed by the local filesystem.
///
/// Artifacts are copied into a fresh temporary directory so analysis never
/// touches the original file.
#[derive(Debug, Default, Clone)]
pub struct LocalDocumentSource;

#[async_trait]
impl DocumentSource for LocalDocumentSource {
    async fn download(&self, evidence: &EvidenceRef) -> Result<LocalEvidence, EvidenceError> {
        if !tokio::fs::try_exists(&evidence.location)
            .await
            .unwrap_or(false)
        {
            return Err(EvidenceError::NotFound(evidence.location.display().to_string()));
        }

        let download_err = |source| EvidenceError::Download {
            path: evidence.location.display().to_string(),
            source,
        };

        let temp_dir = TempDir::new().map_err(download_err)?;
        let target = temp_dir.path().join(&evidence.name);
        tokio::fs::copy(&evidence.location, &target)
            .await
            .map_err(download_err)?;

        debug!("Downloaded evidence {} to {}", evidence.id, target.display());
        Ok(LocalEvidence {
            path: target,
            temp_dir: Some(temp_dir),
        })
    }

    async fn cleanup(&self, local: LocalEvidence) {
        if let Some(temp_dir) = local.temp_dir {
            let dir = temp_dir.path().to_path_buf();
            match temp_dir.close() {
                Ok(()) => debug!("Removed temporary evidence directory {}", dir.display()),
                Err(e) => warn!(
                    "Failed to remove temporary evidence directory {}: {}",
                    dir.display(),
                    e
                ),
            }
        }
    }
}

/// Map an image file extension to its media type.
pub fn image_media_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Read a file as image bytes or UTF-8 text depending on its extension.
pub async fn read_content(path: &Path) -> Result<EvidenceContent, EvidenceError> {
    let read_err = |source| EvidenceError::Read {
        path: path.display().to_string(),
        source,
    };

    if let Some(media_type) = image_media_type(path) {
        let data = tokio::fs::read(path).await.map_err(read_err)?;
        if data.is_empty() {
            return Err(EvidenceError::Unreadable(path.display().to_string()));
        }
        return Ok(EvidenceContent::Image {
            data,
            media_type: media_type.to_string(),
        });
    }

    let bytes = tokio::fs::read(path).await.map_err(read_err)?;
    let text = String::from_utf8(bytes)
        .map_err(|_| EvidenceError::Unreadable(path.display().to_string()))?;
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(EvidenceError::Unreadable(path.display().to_string()));
    }

    Ok(EvidenceContent::Text(text))
}
