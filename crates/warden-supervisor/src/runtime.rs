//! Supervisor for the local inference runtime.
//!
//! A full [`setup`](RuntimeServiceSupervisor::setup) cleans stale downloads,
//! brings the runtime binary up to date, makes sure the model is present and
//! then starts the server. Each phase is published as a [`RuntimeStatus`]
//! snapshot on a watch channel.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::acquire::{file_exists, ArtifactPipeline};
use crate::config::RuntimeConfig;
use crate::error::{Result, SupervisorError};
use crate::model::ModelArtifact;
use crate::paths::bin_dir;
use crate::health::loopback_url;
use crate::process::{ProcessObserver, ServiceProcessController, TracingObserver};
use crate::state::{DownloadProgress, RuntimeState, RuntimeStatus, StatusReporter};

/// Readiness endpoint of the model server.
pub const RUNTIME_HEALTH_PATH: &str = "/v1/models";

const SERVICE: &str = "inference runtime";

pub struct RuntimeServiceSupervisor {
    config: RuntimeConfig,
    model: Mutex<ModelArtifact>,
    pipeline: ArtifactPipeline,
    controller: ServiceProcessController,
    status: watch::Sender<RuntimeStatus>,
    /// Serializes setup, start and the tail of stop.
    op_lock: tokio::sync::Mutex<()>,
    /// Cancelled by `stop()`; replaced once the stop has completed.
    run: Mutex<CancellationToken>,
}

impl RuntimeServiceSupervisor {
    /// Create a supervisor that logs runtime output through `tracing`.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }

    /// Create a supervisor that reports runtime output to `observer`.
    pub fn with_observer(config: RuntimeConfig, observer: Arc<dyn ProcessObserver>) -> Self {
        let (status, _) = watch::channel(RuntimeStatus::default());
        Self {
            model: Mutex::new(config.model.clone()),
            pipeline: ArtifactPipeline::new(&config),
            controller: ServiceProcessController::with_observer(
                SERVICE,
                config.grace_window,
                observer,
            ),
            status,
            op_lock: tokio::sync::Mutex::new(()),
            run: Mutex::new(CancellationToken::new()),
            config,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Acquire everything that is missing, then start the runtime.
    ///
    /// Failures end up in the status as [`RuntimeState::Error`]; nothing is
    /// retried within one call.
    pub async fn setup(&self) {
        let run = self.current_run();
        let _op = self.op_lock.lock().await;
        if run.is_cancelled() {
            debug!("Runtime setup skipped: supervisor was stopped");
            return;
        }

        info!("Setting up local inference runtime");
        if let Err(e) = self.setup_locked(&run).await {
            self.fail(&run, &e);
        }
    }

    async fn setup_locked(&self, run: &CancellationToken) -> Result<()> {
        let removed = self.pipeline.cleanup_temp_files().await;
        if removed > 0 {
            info!("Removed {} stale download(s)", removed);
        }

        self.transition(RuntimeState::DownloadingRuntime {
            progress: DownloadProgress::default(),
        });
        let runtime_progress =
            |progress: DownloadProgress| self.transition(RuntimeState::DownloadingRuntime { progress });
        // Acquisition is cancelled through the pipeline so that a partial
        // download removes its own temp file before the phase returns.
        let runtime = self.pipeline.ensure_runtime_binary(&runtime_progress).await?;
        self.status
            .send_modify(|status| status.runtime_version = Some(runtime.version.clone()));
        if !runtime.downloaded {
            self.transition(RuntimeState::Idle);
        }

        let model = self.model();
        self.transition(RuntimeState::DownloadingModel {
            progress: DownloadProgress::default(),
        });
        let model_progress =
            |progress: DownloadProgress| self.transition(RuntimeState::DownloadingModel { progress });
        self.pipeline
            .ensure_model_artifact(&model, &model_progress)
            .await?;

        self.start_locked(run).await
    }

    /// Start the runtime from the installed binary and model without
    /// checking for updates.
    pub async fn start(&self) -> Result<()> {
        let run = self.current_run();
        let _op = self.op_lock.lock().await;
        if run.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }

        let result = self.start_locked(&run).await;
        if let Err(e) = &result {
            self.fail(&run, e);
        }
        result
    }

    async fn start_locked(&self, run: &CancellationToken) -> Result<()> {
        if run.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }

        let runtime = self
            .pipeline
            .installed_runtime()
            .await
            .ok_or_else(|| SupervisorError::MissingArtifact {
                kind: "runtime binary",
                path: bin_dir(self.pipeline.data_dir()),
            })?;

        let model = self.model();
        let model_path = self.pipeline.model_path(&model);
        if !file_exists(&model_path).await {
            return Err(SupervisorError::MissingArtifact {
                kind: "model",
                path: model_path,
            });
        }

        let port = self.config.port;
        self.status.send_modify(|status| {
            status.state = RuntimeState::Starting;
            status.runtime_version = Some(runtime.version.clone());
        });

        info!(
            "Starting runtime {} with model '{}'",
            runtime.version, model.name
        );
        let args = self.launch_args(&model_path);
        self.controller.spawn(&runtime.path, &args, &[], port).await?;
        self.status.send_modify(|status| status.port = Some(port));

        let url = loopback_url(port, RUNTIME_HEALTH_PATH);
        let healthy = cancellable(
            run,
            self.controller.wait_for_healthy(
                &url,
                self.config.poll_interval,
                self.config.startup_timeout,
            ),
        )
        .await;
        if let Err(e) = healthy {
            self.controller.stop().await;
            return Err(e);
        }

        self.transition(RuntimeState::Ready);
        info!("Local inference runtime ready on port {}", port);
        Ok(())
    }

    fn launch_args(&self, model_path: &Path) -> Vec<String> {
        vec![
            "--server".to_string(),
            "--nobrowser".to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            self.config.port.to_string(),
            "-m".to_string(),
            model_path.to_string_lossy().into_owned(),
            "-ngl".to_string(),
            self.config.gpu_layers.to_string(),
            "-t".to_string(),
            self.config.thread_count().to_string(),
        ]
    }

    /// Stop, then start again from the installed artifacts.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    /// Switch the served model and restart.
    pub async fn set_model(&self, model: ModelArtifact) -> Result<()> {
        info!("Switching runtime model to '{}'", model.name);
        *self.lock_model() = model;
        self.restart().await
    }

    /// Cancel any in-flight work, stop the process and reset to
    /// [`RuntimeState::Idle`]. Never fails.
    pub async fn stop(&self) {
        self.current_run().cancel();
        self.pipeline.close();
        self.controller.stop().await;

        let _op = self.op_lock.lock().await;
        // A setup that was between phases may have spawned before seeing
        // the cancellation.
        self.controller.stop().await;
        *self.run.lock().unwrap_or_else(|e| e.into_inner()) = CancellationToken::new();
        self.pipeline.reopen();

        self.status.send_modify(|status| {
            status.state = RuntimeState::Idle;
            status.port = None;
        });
        info!("Local inference runtime stopped");
    }

    /// Current status snapshot.
    pub fn get_status(&self) -> RuntimeStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<RuntimeStatus> {
        self.status.subscribe()
    }

    /// Check if the runtime process is alive.
    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    /// Recorded version of the installed runtime.
    pub async fn installed_version(&self) -> Option<String> {
        self.pipeline.installed_version().await
    }

    /// Model files present on disk.
    pub fn list_installed_models(&self) -> Result<Vec<String>> {
        self.pipeline.list_installed_models()
    }

    /// The model artifact the runtime serves.
    pub fn model(&self) -> ModelArtifact {
        self.lock_model().clone()
    }

    fn lock_model(&self) -> MutexGuard<'_, ModelArtifact> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_run(&self) -> CancellationToken {
        self.run.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn transition(&self, state: RuntimeState) {
        let next = self.status.borrow().with_state(state);
        if next.state.label() != self.status.borrow().state.label() {
            debug!("Runtime state: {}", next.state.label());
        }
        self.status.send_replace(next);
    }

    fn fail(&self, run: &CancellationToken, e: &SupervisorError) {
        // stop() owns the final state of a cancelled run.
        if run.is_cancelled() || e.is_cancelled() {
            info!("Runtime setup cancelled");
            return;
        }
        error!("Local inference runtime failed: {}", e);
        self.status.send_modify(|status| {
            status.state = RuntimeState::Error {
                message: e.to_string(),
            };
            status.port = None;
        });
    }
}

impl StatusReporter for RuntimeServiceSupervisor {
    type Status = RuntimeStatus;

    fn status(&self) -> RuntimeStatus {
        self.get_status()
    }

    fn port(&self) -> Option<u16> {
        self.status.borrow().port
    }
}

async fn cancellable<T>(run: &CancellationToken, work: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        result = work => result,
        _ = run.cancelled() => Err(SupervisorError::Cancelled),
    }
}
