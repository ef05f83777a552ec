//! Supervisor configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::model::ModelArtifact;
use crate::paths::warden_data_dir;
use crate::{DEFAULT_BACKEND_PORT, DEFAULT_RUNTIME_PORT};

/// Release descriptor for the inference runtime.
pub const DEFAULT_RELEASE_URL: &str =
    "https://api.github.com/repos/Mozilla-Ocho/llamafile/releases/latest";

/// Release assets are named `{prefix}-{version}`.
pub const DEFAULT_ASSET_PREFIX: &str = "llamafile";

/// Executable stem of the bundled backend.
pub const DEFAULT_BACKEND_EXECUTABLE: &str = "warden-backend";

/// Environment variable carrying the per-launch backend secret.
pub const DEFAULT_TOKEN_ENV: &str = "WARDEN_LOCAL_TOKEN";

pub const DEFAULT_RUNTIME_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_BACKEND_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_METADATA_REDIRECTS: usize = 5;
pub const DEFAULT_DOWNLOAD_REDIRECTS: usize = 10;

/// Offload every layer the GPU can hold.
pub const DEFAULT_GPU_LAYERS: u32 = 999;

/// Configuration for the inference runtime supervisor.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root holding `bin/` and `models/`
    pub data_dir: PathBuf,
    /// Loopback port the runtime binds
    pub port: u16,
    /// Release descriptor endpoint
    pub release_url: String,
    /// Asset name prefix, combined with the release version
    pub asset_prefix: String,
    /// Model served by the runtime
    pub model: ModelArtifact,
    /// Value for `-ngl`
    pub gpu_layers: u32,
    /// Value for `-t`; `None` uses the available parallelism
    pub threads: Option<usize>,
    /// Absolute deadline for the health check after spawn
    pub startup_timeout: Duration,
    /// Delay between health checks
    pub poll_interval: Duration,
    /// Time between graceful and forceful termination
    pub grace_window: Duration,
    /// Redirect bound for the release descriptor
    pub metadata_redirects: usize,
    /// Redirect bound for artifact downloads
    pub download_redirects: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: warden_data_dir(),
            port: DEFAULT_RUNTIME_PORT,
            release_url: DEFAULT_RELEASE_URL.to_string(),
            asset_prefix: DEFAULT_ASSET_PREFIX.to_string(),
            model: ModelArtifact::default_artifact(),
            gpu_layers: DEFAULT_GPU_LAYERS,
            threads: None,
            startup_timeout: DEFAULT_RUNTIME_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_window: DEFAULT_GRACE_WINDOW,
            metadata_redirects: DEFAULT_METADATA_REDIRECTS,
            download_redirects: DEFAULT_DOWNLOAD_REDIRECTS,
        }
    }
}

impl RuntimeConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = env_var("WARDEN_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = env_parse("WARDEN_RUNTIME_PORT") {
            config.port = port;
        }
        if let Some(url) = env_var("WARDEN_RELEASE_URL") {
            config.release_url = url;
        }
        if let Some(url) = env_var("WARDEN_MODEL_URL") {
            config.model.url = url;
        }
        if let Some(layers) = env_parse("WARDEN_GPU_LAYERS") {
            config.gpu_layers = layers;
        }
        if let Some(threads) = env_parse("WARDEN_THREADS") {
            config.threads = Some(threads);
        }
        if let Some(secs) = env_parse("WARDEN_RUNTIME_STARTUP_TIMEOUT_SECS") {
            config.startup_timeout = Duration::from_secs(secs);
        }

        config
    }

    /// Set the data root.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the loopback port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the release descriptor URL.
    pub fn with_release_url(mut self, url: impl Into<String>) -> Self {
        self.release_url = url.into();
        self
    }

    /// Set the runtime asset name prefix.
    pub fn with_asset_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.asset_prefix = prefix.into();
        self
    }

    /// Set the model artifact.
    pub fn with_model(mut self, model: ModelArtifact) -> Self {
        self.model = model;
        self
    }

    /// Set how long to wait for the health check.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the health poll period.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the delay between graceful and forceful termination.
    pub fn with_grace_window(mut self, grace: Duration) -> Self {
        self.grace_window = grace;
        self
    }

    /// Thread count passed to the runtime.
    pub fn thread_count(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }
}

/// Configuration for the bundled API backend supervisor.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Loopback port passed as `--port`
    pub port: u16,
    /// Executable stem inside the resources directory
    pub executable: String,
    /// Environment variable carrying the auth token
    pub token_env: String,
    /// Liveness endpoint path
    pub health_path: String,
    /// Generous: the backend may provision itself on first run
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub grace_window: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_BACKEND_PORT,
            executable: DEFAULT_BACKEND_EXECUTABLE.to_string(),
            token_env: DEFAULT_TOKEN_ENV.to_string(),
            health_path: "/health".to_string(),
            startup_timeout: DEFAULT_BACKEND_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_window: DEFAULT_GRACE_WINDOW,
        }
    }
}

impl BackendConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse("WARDEN_BACKEND_PORT") {
            config.port = port;
        }
        if let Some(name) = env_var("WARDEN_BACKEND_EXECUTABLE") {
            config.executable = name;
        }
        if let Some(secs) = env_parse("WARDEN_BACKEND_STARTUP_TIMEOUT_SECS") {
            config.startup_timeout = Duration::from_secs(secs);
        }

        config
    }

    /// Set the loopback port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the backend executable stem.
    pub fn with_executable(mut self, stem: impl Into<String>) -> Self {
        self.executable = stem.into();
        self
    }

    /// Set how long to wait for the health check.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the health poll period.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the delay between graceful and forceful termination.
    pub fn with_grace_window(mut self, grace: Duration) -> Self {
        self.grace_window = grace;
        self
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.port, DEFAULT_RUNTIME_PORT);
        assert_eq!(runtime.startup_timeout, Duration::from_secs(120));
        assert_eq!(runtime.metadata_redirects, 5);
        assert_eq!(runtime.download_redirects, 10);

        let backend = BackendConfig::default();
        assert_eq!(backend.startup_timeout, Duration::from_secs(60));
        assert_eq!(backend.grace_window, Duration::from_secs(5));
    }

    #[test]
    fn test_builder_overrides() {
        let config = RuntimeConfig::default()
            .with_port(9999)
            .with_data_dir("/tmp/warden-test")
            .with_grace_window(Duration::from_millis(50));
        assert_eq!(config.port, 9999);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/warden-test"));
        assert_eq!(config.grace_window, Duration::from_millis(50));
    }

    #[test]
    fn test_thread_count_override() {
        let mut config = RuntimeConfig::default();
        assert!(config.thread_count() >= 1);
        config.threads = Some(3);
        assert_eq!(config.thread_count(), 3);
    }
}
