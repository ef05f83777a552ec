//! Error types for supervisor operations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while acquiring, starting or stopping a service.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The child process could not be launched, or died before it was ready.
    #[error("Failed to spawn {service}: {reason}")]
    Spawn { service: String, reason: String },

    /// The service never answered its health check before the deadline.
    #[error("Timed out after {timeout:?} waiting for {service} to become ready")]
    StartupTimeout { service: String, timeout: Duration },

    /// No release asset matched the expected name.
    #[error("No release asset named '{expected}'. Available assets: {}", format_assets(.available))]
    AssetResolution {
        expected: String,
        available: Vec<String>,
    },

    /// Remote request failed or returned a non-success status.
    #[error("Network error: {0}")]
    Network(String),

    /// A redirect chain exceeded the configured bound.
    #[error("Too many redirects (limit {limit}) while fetching {url}")]
    TooManyRedirects { url: String, limit: usize },

    /// Local filesystem operation failed.
    #[error("Filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The persisted version record could not be parsed.
    ///
    /// Callers treat this as a cache miss.
    #[error("Version metadata at {} is corrupt: {reason}", .path.display())]
    VersionMetadataCorrupt { path: PathBuf, reason: String },

    /// Downloaded content did not match the expected digest.
    #[error("Checksum mismatch for {name}. Expected: {expected}, got: {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// A binary or model required to start the runtime is not installed.
    #[error("{kind} not found at {}. Run setup to download it", .path.display())]
    MissingArtifact { kind: &'static str, path: PathBuf },

    /// The active request was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SupervisorError {
    /// Wrap an I/O error with the path it concerns.
    pub fn fs(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn spawn(service: &str, reason: impl Into<String>) -> Self {
        Self::Spawn {
            service: service.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error came from a cancelled request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn format_assets(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

/// Result alias for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_resolution_lists_names() {
        let err = SupervisorError::AssetResolution {
            expected: "llamafile-5".to_string(),
            available: vec!["llamafile-4".to_string(), "zipalign-5".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("llamafile-5"));
        assert!(msg.contains("llamafile-4, zipalign-5"));
    }

    #[test]
    fn test_asset_resolution_empty_list() {
        let err = SupervisorError::AssetResolution {
            expected: "llamafile-5".to_string(),
            available: vec![],
        };
        assert!(err.to_string().contains("(none)"));
    }
}
