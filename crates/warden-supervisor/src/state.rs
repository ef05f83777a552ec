//! Status snapshots published to the UI.

use serde::{Deserialize, Serialize};

/// Bytes received for the artifact currently downloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    /// `None` when neither the server nor the caller knows the size.
    pub bytes_total: Option<u64>,
}

impl DownloadProgress {
    /// Build a progress value, dropping a total that the download has
    /// already exceeded.
    pub fn new(bytes_downloaded: u64, bytes_total: Option<u64>) -> Self {
        Self {
            bytes_downloaded,
            bytes_total: bytes_total.filter(|total| *total >= bytes_downloaded),
        }
    }

    /// Fraction complete in `0.0..=1.0`, when the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_total {
            Some(0) => Some(1.0),
            Some(total) => Some(self.bytes_downloaded as f64 / total as f64),
            None => None,
        }
    }
}

/// Lifecycle of the inference runtime.
///
/// Progress only exists inside the downloading variants.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum RuntimeState {
    #[default]
    Idle,
    DownloadingRuntime {
        progress: DownloadProgress,
    },
    DownloadingModel {
        progress: DownloadProgress,
    },
    Starting,
    Ready,
    Error {
        message: String,
    },
}

impl RuntimeState {
    /// Transfer progress while a download phase is active.
    pub fn progress(&self) -> Option<DownloadProgress> {
        match self {
            Self::DownloadingRuntime { progress } | Self::DownloadingModel { progress } => {
                Some(*progress)
            }
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Failure message in the `Error` state.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { message } => Some(message),
            _ => None,
        }
    }

    /// Short label for logs and terminals.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::DownloadingRuntime { .. } => "downloading-runtime",
            Self::DownloadingModel { .. } => "downloading-model",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Error { .. } => "error",
        }
    }
}

/// Snapshot of the runtime supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuntimeStatus {
    #[serde(flatten)]
    pub state: RuntimeState,
    /// Installed runtime release, once known.
    pub runtime_version: Option<String>,
    /// Bound port while the process is running.
    pub port: Option<u16>,
}

impl RuntimeStatus {
    pub(crate) fn with_state(&self, state: RuntimeState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

/// Lifecycle of the bundled backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum BackendState {
    #[default]
    NotStarted,
    Starting,
    Ready,
    Stopped,
    Error {
        message: String,
    },
}

/// Snapshot of the backend supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendStatus {
    #[serde(flatten)]
    pub state: BackendState,
    pub port: Option<u16>,
}

/// Read-only query surface for the UI layer.
///
/// Both methods are cheap, side-effect free, and valid before the
/// service was ever started.
pub trait StatusReporter {
    type Status: Clone + Serialize;

    /// Copy of the current status.
    fn status(&self) -> Self::Status;

    /// Port of the running service, if any.
    fn port(&self) -> Option<u16>;
}
