//! Model artifact descriptors.

use std::fs;
use std::path::Path;

use crate::error::{Result, SupervisorError};
use crate::{DEFAULT_MODEL_FILENAME, DEFAULT_MODEL_NAME};

/// Model files smaller than this are assumed to be truncated downloads.
pub const DEFAULT_MODEL_MIN_BYTES: u64 = 100 * 1024 * 1024;

/// A model file the inference runtime serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    /// Display name of the model.
    pub name: String,
    /// Filename on disk.
    pub filename: String,
    /// Download URL.
    pub url: String,
    /// An existing file must be larger than this to be accepted.
    pub min_bytes: u64,
    /// Size in bytes, used for progress when the server omits content-length.
    pub size_bytes: Option<u64>,
    /// Expected SHA256 checksum (optional).
    pub sha256: Option<String>,
}

impl ModelArtifact {
    /// Get the default model served by the runtime.
    pub fn default_artifact() -> Self {
        Self {
            name: DEFAULT_MODEL_NAME.to_string(),
            filename: DEFAULT_MODEL_FILENAME.to_string(),
            url: format!(
                "https://huggingface.co/bartowski/Llama-3.2-1B-Instruct-GGUF/resolve/main/{}",
                DEFAULT_MODEL_FILENAME
            ),
            min_bytes: DEFAULT_MODEL_MIN_BYTES,
            size_bytes: None,
            sha256: None,
        }
    }

    /// Whether a file of `len` bytes is large enough to be a complete
    /// download.
    pub fn accepts_size(&self, len: u64) -> bool {
        len > self.min_bytes
    }
}

impl Default for ModelArtifact {
    fn default() -> Self {
        Self::default_artifact()
    }
}

/// List model files installed in `dir`, skipping in-progress downloads.
pub fn list_installed(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut models: Vec<String> = fs::read_dir(dir)
        .map_err(|e| SupervisorError::fs(dir, e))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter(|entry| !crate::paths::is_temp_file(&entry.path()))
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect();
    models.sort();

    Ok(models)
}
