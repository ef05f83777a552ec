//! Supervision of the local services behind the desktop app.
//!
//! Two services run on loopback: the bundled API backend and a local
//! inference runtime (a llamafile-style model server). This crate keeps the
//! runtime binary and model current, spawns both processes, waits for them
//! to answer their health endpoints and tears them down again.

mod acquire;
mod backend;
pub mod config;
mod download;
mod error;
mod health;
mod model;
pub mod paths;
mod process;
mod release;
mod runtime;
mod state;

#[cfg(test)]
mod testing;

pub use acquire::{ArtifactPipeline, InstalledRuntime};
pub use backend::{AuthToken, BackendServiceSupervisor};
pub use config::{BackendConfig, RuntimeConfig};
pub use download::{DownloadOptions, Downloader, ProgressFn};
pub use error::{Result, SupervisorError};
pub use health::{HealthCheck, HealthOutcome};
pub use model::ModelArtifact;
pub use process::{ProcessObserver, ServiceProcessController, TracingObserver};
pub use release::{ReleaseAsset, ReleaseDescriptor, VersionRecord};
pub use runtime::{RuntimeServiceSupervisor, RUNTIME_HEALTH_PATH};
pub use state::{
    BackendState, BackendStatus, DownloadProgress, RuntimeState, RuntimeStatus, StatusReporter,
};

/// Default port for the local inference runtime.
pub const DEFAULT_RUNTIME_PORT: u16 = 11435;

/// Default port for the bundled API backend.
pub const DEFAULT_BACKEND_PORT: u16 = 8765;

/// Default model served by the runtime.
pub const DEFAULT_MODEL_NAME: &str = "llama-3.2-1b-instruct";

/// Default model filename.
pub const DEFAULT_MODEL_FILENAME: &str = "Llama-3.2-1B-Instruct-Q4_K_M.gguf";
