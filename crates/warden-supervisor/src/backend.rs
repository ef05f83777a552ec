//! Supervisor for the bundled API backend.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::RngCore;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::BackendConfig;
use crate::error::{Result, SupervisorError};
use crate::paths::executable_name;
use crate::health::loopback_url;
use crate::process::{ProcessObserver, ServiceProcessController, TracingObserver};
use crate::state::{BackendState, BackendStatus, StatusReporter};

const SERVICE: &str = "API backend";

/// Per-launch secret shared between the host and the backend.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// 256 random bits, hex encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// The hex-encoded secret.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Runs the backend executable shipped next to the application.
pub struct BackendServiceSupervisor {
    config: BackendConfig,
    controller: ServiceProcessController,
    status: watch::Sender<BackendStatus>,
    token: Mutex<Option<AuthToken>>,
    op_lock: tokio::sync::Mutex<()>,
}

impl BackendServiceSupervisor {
    /// Create a supervisor that logs backend output through `tracing`.
    pub fn new(config: BackendConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }

    /// Create a supervisor that reports backend output to `observer`.
    pub fn with_observer(config: BackendConfig, observer: Arc<dyn ProcessObserver>) -> Self {
        let (status, _) = watch::channel(BackendStatus::default());
        Self {
            controller: ServiceProcessController::with_observer(
                SERVICE,
                config.grace_window,
                observer,
            ),
            config,
            status,
            token: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Launch the backend from `resources_dir` and wait until `/health`
    /// answers.
    ///
    /// A fresh token is generated for every launch and handed to the child
    /// only through the environment.
    pub async fn start(&self, resources_dir: &Path) -> Result<()> {
        let _op = self.op_lock.lock().await;

        let executable = resources_dir.join(executable_name(&self.config.executable));
        let port = self.config.port;
        let token = AuthToken::generate();
        let env = vec![(self.config.token_env.clone(), token.as_str().to_string())];
        let args = vec!["--port".to_string(), port.to_string()];

        self.publish(BackendState::Starting, None);
        info!("Launching backend from {:?}", executable);

        if let Err(e) = self.controller.spawn(&executable, &args, &env, port).await {
            return Err(self.fail(e));
        }
        *self.lock_token() = Some(token);
        self.publish(BackendState::Starting, Some(port));

        let url = loopback_url(port, &self.config.health_path);
        if let Err(e) = self
            .controller
            .wait_for_healthy(&url, self.config.poll_interval, self.config.startup_timeout)
            .await
        {
            self.controller.stop().await;
            return Err(self.fail(e));
        }

        self.publish(BackendState::Ready, Some(port));
        info!("Backend ready on port {}", port);
        Ok(())
    }

    /// Stop the backend and forget its token. Never fails.
    pub async fn stop(&self) {
        // Killing first makes a pending health wait fail fast.
        self.controller.stop().await;
        let _op = self.op_lock.lock().await;
        self.controller.stop().await;

        self.lock_token().take();
        if self.status.borrow().state != BackendState::NotStarted {
            self.publish(BackendState::Stopped, None);
            info!("Backend stopped");
        }
    }

    /// Token of the running backend.
    pub fn local_token(&self) -> Option<String> {
        self.lock_token().as_ref().map(|t| t.as_str().to_string())
    }

    /// Current status snapshot.
    pub fn get_status(&self) -> BackendStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<BackendStatus> {
        self.status.subscribe()
    }

    /// Check if the backend process is alive.
    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    fn lock_token(&self) -> MutexGuard<'_, Option<AuthToken>> {
        self.token.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: BackendState, port: Option<u16>) {
        self.status.send_replace(BackendStatus { state, port });
    }

    fn fail(&self, e: SupervisorError) -> SupervisorError {
        error!("Backend failed to start: {}", e);
        self.lock_token().take();
        self.publish(
            BackendState::Error {
                message: e.to_string(),
            },
            None,
        );
        e
    }
}

impl StatusReporter for BackendServiceSupervisor {
    type Status = BackendStatus;

    fn status(&self) -> BackendStatus {
        self.get_status()
    }

    fn port(&self) -> Option<u16> {
        self.status.borrow().port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_hex_and_unique() {
        let a = AuthToken::generate();
        let b = AuthToken::generate();
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = AuthToken::generate();
        let debug = format!("{:?}", token);
        assert!(!debug.contains(token.as_str()));
        assert!(debug.contains("redacted"));
    }

    #[tokio::test]
    async fn test_status_before_start() {
        let supervisor = BackendServiceSupervisor::new(BackendConfig::default());
        assert_eq!(supervisor.status().state, BackendState::NotStarted);
        assert_eq!(StatusReporter::port(&supervisor), None);
        assert_eq!(supervisor.local_token(), None);

        supervisor.stop().await;
        assert_eq!(supervisor.get_status().state, BackendState::NotStarted);
    }

    #[tokio::test]
    async fn test_missing_executable_sets_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = BackendServiceSupervisor::new(BackendConfig::default());

        let err = supervisor.start(dir.path()).await.unwrap_err();

        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(matches!(
            supervisor.get_status().state,
            BackendState::Error { .. }
        ));
        assert_eq!(supervisor.local_token(), None);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::testing::StubServer;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;
        use tempfile::TempDir;

        /// Records its environment token and argv next to itself.
        const BACKEND_SCRIPT: &str = r#"#!/bin/sh
here=$(dirname "$0")
printf '%s\n' "$@" > "$here/args.tmp" && mv "$here/args.tmp" "$here/args.txt"
printf '%s' "$WARDEN_LOCAL_TOKEN" > "$here/token.tmp" && mv "$here/token.tmp" "$here/token.txt"
exec sleep 30
"#;

        fn resources() -> TempDir {
            let dir = tempfile::tempdir().unwrap();
            let exe = dir.path().join(executable_name("warden-backend"));
            std::fs::write(&exe, BACKEND_SCRIPT).unwrap();
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
            dir
        }

        fn config(server: &StubServer) -> BackendConfig {
            BackendConfig::default()
                .with_port(server.port())
                .with_poll_interval(Duration::from_millis(50))
                .with_startup_timeout(Duration::from_secs(10))
                .with_grace_window(Duration::from_secs(2))
        }

        async fn read_when_written(path: &Path) -> String {
            for _ in 0..500 {
                if let Ok(content) = std::fs::read_to_string(path) {
                    return content;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("{:?} was never written", path);
        }

        #[tokio::test]
        async fn test_start_passes_token_only_through_env() {
            let server = StubServer::start().await;
            server.route("/health", 200, "ok");
            let dir = resources();
            let supervisor = BackendServiceSupervisor::new(config(&server));

            supervisor.start(dir.path()).await.unwrap();

            let status = supervisor.get_status();
            assert_eq!(status.state, BackendState::Ready);
            assert_eq!(status.port, Some(server.port()));
            assert!(supervisor.is_running());

            let token = supervisor.local_token().unwrap();
            assert_eq!(read_when_written(&dir.path().join("token.txt")).await, token);
            let args = read_when_written(&dir.path().join("args.txt")).await;
            assert_eq!(args, format!("--port\n{}\n", server.port()));
            assert!(!args.contains(&token));

            supervisor.stop().await;
            assert_eq!(supervisor.get_status().state, BackendState::Stopped);
            assert_eq!(supervisor.local_token(), None);
            assert!(!supervisor.is_running());
        }

        #[tokio::test]
        async fn test_each_launch_gets_a_fresh_token() {
            let server = StubServer::start().await;
            server.route("/health", 200, "ok");
            let dir = resources();
            let supervisor = BackendServiceSupervisor::new(config(&server));

            supervisor.start(dir.path()).await.unwrap();
            let first = supervisor.local_token().unwrap();
            supervisor.stop().await;
            supervisor.start(dir.path()).await.unwrap();
            let second = supervisor.local_token().unwrap();

            assert_ne!(first, second);
            supervisor.stop().await;
        }

        #[tokio::test]
        async fn test_health_timeout_stops_backend() {
            let server = StubServer::start().await;
            server.route("/health", 503, "provisioning");
            let dir = resources();
            let supervisor = BackendServiceSupervisor::new(
                config(&server).with_startup_timeout(Duration::from_millis(300)),
            );

            let err = supervisor.start(dir.path()).await.unwrap_err();

            assert!(matches!(err, SupervisorError::StartupTimeout { .. }));
            assert!(!supervisor.is_running());
            assert_eq!(supervisor.local_token(), None);
            assert_eq!(StatusReporter::port(&supervisor), None);
        }
    }
}
