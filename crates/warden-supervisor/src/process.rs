//! Child process control for a single loopback service.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};
use crate::health::HealthCheck;

/// How long to wait for the exit event after a forceful kill before the
/// handle is released anyway.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Lower bound on the health poll period.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Receives output and exit events from a supervised child.
pub trait ProcessObserver: Send + Sync {
    fn on_stdout(&self, service: &str, line: &str);
    fn on_stderr(&self, service: &str, line: &str);
    fn on_exit(&self, _service: &str, _status: Option<ExitStatus>) {}
}

/// Forwards child output to `tracing`: stdout at info, stderr at warn.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ProcessObserver for TracingObserver {
    fn on_stdout(&self, service: &str, line: &str) {
        info!(target: "warden::child", service, "{}", line);
    }

    fn on_stderr(&self, service: &str, line: &str) {
        warn!(target: "warden::child", service, "{}", line);
    }

    fn on_exit(&self, service: &str, status: Option<ExitStatus>) {
        match status {
            Some(status) => info!("{} exited with {}", service, status),
            None => warn!("{} exited with unknown status", service),
        }
    }
}

/// A running child process.
struct ServiceProcessHandle {
    pid: Option<u32>,
    port: u16,
    /// Flips to `true` once the child has been reaped.
    exited: watch::Receiver<bool>,
    /// Asks the reaper task to kill the child. Dropping it has the same effect.
    kill: Option<oneshot::Sender<()>>,
}

impl ServiceProcessHandle {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

/// Spawns, health-checks and stops one child process.
pub struct ServiceProcessController {
    service: String,
    grace: Duration,
    observer: Arc<dyn ProcessObserver>,
    health: HealthCheck,
    handle: Mutex<Option<ServiceProcessHandle>>,
    /// Serializes spawn and stop.
    lifecycle: tokio::sync::Mutex<()>,
}

impl ServiceProcessController {
    /// Create a controller that logs child output through `tracing`.
    pub fn new(service: impl Into<String>, grace: Duration) -> Self {
        Self::with_observer(service, grace, Arc::new(TracingObserver))
    }

    /// Create a controller that reports child output to `observer`.
    pub fn with_observer(
        service: impl Into<String>,
        grace: Duration,
        observer: Arc<dyn ProcessObserver>,
    ) -> Self {
        Self {
            service: service.into(),
            grace,
            observer,
            health: HealthCheck::new(),
            handle: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Label used in logs and errors.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// PID of the live child.
    pub fn pid(&self) -> Option<u32> {
        self.lock_handle()
            .as_ref()
            .filter(|h| !h.has_exited())
            .and_then(|h| h.pid)
    }

    /// Port of the live child.
    pub fn port(&self) -> Option<u16> {
        self.lock_handle()
            .as_ref()
            .filter(|h| !h.has_exited())
            .map(|h| h.port)
    }

    /// Check if the child process is running.
    pub fn is_running(&self) -> bool {
        self.lock_handle()
            .as_ref()
            .map(|h| !h.has_exited())
            .unwrap_or(false)
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, Option<ServiceProcessHandle>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Launch `executable`. A previously spawned child is stopped first.
    pub async fn spawn(
        &self,
        executable: &Path,
        args: &[String],
        env: &[(String, String)],
        port: u16,
    ) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        match tokio::fs::metadata(executable).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                return Err(SupervisorError::spawn(
                    &self.service,
                    format!("executable not found at {}", executable.display()),
                ))
            }
        }

        let previous = self.lock_handle().take();
        if let Some(mut previous) = previous {
            warn!("{} is already running; stopping it before respawn", self.service);
            self.terminate(&mut previous).await;
        }

        info!("Starting {} on port {}", self.service, port);

        let mut std_cmd = std::process::Command::new(executable);
        std_cmd
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so termination reaches grandchildren.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            std_cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = spawn_child(&mut cmd)
            .await
            .map_err(|e| SupervisorError::spawn(&self.service, e.to_string()))?;
        let pid = child.id();
        debug!("{} process started with PID: {:?}", self.service, pid);

        if let Some(out) = child.stdout.take() {
            let observer = self.observer.clone();
            let service = self.service.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    observer.on_stdout(&service, &line);
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            let observer = self.observer.clone();
            let service = self.service.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    observer.on_stderr(&service, &line);
                }
            });
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let observer = self.observer.clone();
        let service = self.service.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!("Kill of {} failed: {}", service, e);
                    }
                    child.wait().await.ok()
                }
            };
            observer.on_exit(&service, status);
            let _ = exited_tx.send(true);
        });

        *self.lock_handle() = Some(ServiceProcessHandle {
            pid,
            port,
            exited: exited_rx,
            kill: Some(kill_tx),
        });

        Ok(())
    }

    /// Poll `url` until it answers 200.
    ///
    /// Connection failures and other statuses are retried every
    /// `poll_interval` until `timeout` has elapsed since the call. Fails
    /// early if the child exits.
    pub async fn wait_for_healthy(
        &self,
        url: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut exited = self.lock_handle().as_ref().map(|h| h.exited.clone());

        let mut ticker = tokio::time::interval(poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Waiting for {} to become ready at {}", self.service, url);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => return Err(self.timeout_error(timeout)),
                _ = wait_exited(&mut exited) => {
                    return Err(SupervisorError::spawn(
                        &self.service,
                        "process exited before becoming ready",
                    ));
                }
            }

            match tokio::time::timeout_at(deadline, self.health.check(url)).await {
                Ok(outcome) if outcome.is_ready() => {
                    info!("{} is ready", self.service);
                    return Ok(());
                }
                Ok(outcome) => debug!("{} not ready yet: {:?}", self.service, outcome),
                Err(_) => return Err(self.timeout_error(timeout)),
            }
        }
    }

    fn timeout_error(&self, timeout: Duration) -> SupervisorError {
        SupervisorError::StartupTimeout {
            service: self.service.clone(),
            timeout,
        }
    }

    /// Stop the child: graceful termination, then a forceful kill once the
    /// grace window elapses. Never fails; a no-op when nothing is running.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let handle = self.lock_handle().take();
        if let Some(mut handle) = handle {
            self.terminate(&mut handle).await;
        }
    }

    async fn terminate(&self, handle: &mut ServiceProcessHandle) {
        if handle.has_exited() {
            debug!("{} already exited", self.service);
            return;
        }

        info!("Stopping {} (PID: {:?})", self.service, handle.pid);
        if let Some(pid) = handle.pid {
            request_terminate(pid).await;
        }

        let mut exited = handle.exited.clone();
        if tokio::time::timeout(self.grace, exited.wait_for(|done| *done))
            .await
            .is_ok()
        {
            debug!("{} exited gracefully", self.service);
            return;
        }

        warn!(
            "{} didn't exit within {:?}, killing...",
            self.service, self.grace
        );
        if let Some(pid) = handle.pid {
            force_kill_group(pid);
        }
        if let Some(kill) = handle.kill.take() {
            let _ = kill.send(());
        }

        if tokio::time::timeout(KILL_WAIT, exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!("{} did not report exit after kill; releasing handle", self.service);
        }
    }
}

/// A just-installed executable can briefly fail with ETXTBSY while a
/// concurrent fork still holds its write descriptor.
async fn spawn_child(cmd: &mut Command) -> std::io::Result<Child> {
    let mut attempt = 0;
    loop {
        match cmd.spawn() {
            Err(e) if is_text_busy(&e) && attempt < 5 => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            result => return result,
        }
    }
}

#[cfg(unix)]
fn is_text_busy(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(not(unix))]
fn is_text_busy(_e: &std::io::Error) -> bool {
    false
}

async fn wait_exited(exited: &mut Option<watch::Receiver<bool>>) {
    match exited {
        // A closed channel also means the reaper is gone.
        Some(rx) => {
            let _ = rx.wait_for(|done| *done).await.is_ok();
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(unix)]
async fn request_terminate(pid: u32) {
    let pid = pid as libc::pid_t;
    unsafe {
        if libc::kill(-pid, libc::SIGTERM) != 0 {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

#[cfg(windows)]
async fn request_terminate(pid: u32) {
    // The runtime may spawn helpers, so take down the whole tree.
    let result = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        warn!("taskkill for PID {} failed: {}", pid, e);
    }
}

#[cfg(unix)]
fn force_kill_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
}

#[cfg(windows)]
fn force_kill_group(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::{free_port, StubServer};
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;

    #[derive(Default)]
    struct Recorder {
        stdout: Mutex<Vec<String>>,
        stderr: Mutex<Vec<String>>,
        exits: Mutex<Vec<Option<ExitStatus>>>,
    }

    impl ProcessObserver for Recorder {
        fn on_stdout(&self, _service: &str, line: &str) {
            self.stdout.lock().unwrap().push(line.to_string());
        }

        fn on_stderr(&self, _service: &str, line: &str) {
            self.stderr.lock().unwrap().push(line.to_string());
        }

        fn on_exit(&self, _service: &str, status: Option<ExitStatus>) {
            self.exits.lock().unwrap().push(status);
        }
    }

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    fn script(body: &str) -> Vec<String> {
        vec!["-c".to_string(), body.to_string()]
    }

    fn controller(grace: Duration) -> (Arc<Recorder>, ServiceProcessController) {
        let recorder = Arc::new(Recorder::default());
        let controller = ServiceProcessController::with_observer("test", grace, recorder.clone());
        (recorder, controller)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_stop_without_process_is_noop() {
        let (_, controller) = controller(Duration::from_millis(50));
        controller.stop().await;
        controller.stop().await;
        assert!(!controller.is_running());
        assert_eq!(controller.port(), None);
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let (_, controller) = controller(Duration::from_millis(50));
        let err = controller
            .spawn(Path::new("/nonexistent/warden-backend"), &[], &[], 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/warden-backend"));
    }

    #[tokio::test]
    async fn test_output_and_env_are_forwarded() {
        let (recorder, controller) = controller(Duration::from_millis(50));
        let env = vec![("WARDEN_TEST_VALUE".to_string(), "secret".to_string())];
        controller
            .spawn(&sh(), &script("echo out-$WARDEN_TEST_VALUE; echo err-line 1>&2"), &env, 7)
            .await
            .unwrap();

        wait_until(|| !recorder.exits.lock().unwrap().is_empty()).await;
        wait_until(|| !recorder.stdout.lock().unwrap().is_empty()).await;
        wait_until(|| !recorder.stderr.lock().unwrap().is_empty()).await;

        assert_eq!(*recorder.stdout.lock().unwrap(), vec!["out-secret".to_string()]);
        assert_eq!(*recorder.stderr.lock().unwrap(), vec!["err-line".to_string()]);
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_graceful_stop() {
        let (recorder, controller) = controller(Duration::from_secs(5));
        controller
            .spawn(&sh(), &script("exec sleep 30"), &[], 7)
            .await
            .unwrap();
        assert!(controller.is_running());
        assert_eq!(controller.port(), Some(7));

        let started = Instant::now();
        controller.stop().await;

        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!controller.is_running());
        let exits = recorder.exits.lock().unwrap();
        assert_eq!(exits[0].and_then(|s| s.signal()), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_ignored_sigterm_escalates_to_kill() {
        let (recorder, controller) = controller(Duration::from_millis(50));
        controller
            .spawn(
                &sh(),
                &script("trap '' TERM; echo armed; while :; do sleep 0.1; done"),
                &[],
                7,
            )
            .await
            .unwrap();
        wait_until(|| recorder.stdout.lock().unwrap().iter().any(|l| l == "armed")).await;

        let started = Instant::now();
        controller.stop().await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!controller.is_running());
        let exits = recorder.exits.lock().unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].and_then(|s| s.signal()), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_concurrent_stop_is_idempotent() {
        let (recorder, controller) = controller(Duration::from_secs(5));
        controller
            .spawn(&sh(), &script("exec sleep 30"), &[], 7)
            .await
            .unwrap();

        tokio::join!(controller.stop(), controller.stop());

        assert!(!controller.is_running());
        assert_eq!(recorder.exits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_healthy_retries_until_listener_appears() {
        let (_, controller) = controller(Duration::from_millis(50));
        let port = free_port();

        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let server = StubServer::start_on(port).await;
            server.route("/health", 200, "ok");
            server
        });

        let url = format!("http://127.0.0.1:{}/health", port);
        controller
            .wait_for_healthy(&url, Duration::from_millis(50), Duration::from_secs(5))
            .await
            .unwrap();

        let server = server.await.unwrap();
        assert!(server.hits("/health") >= 1);
    }

    #[tokio::test]
    async fn test_wait_for_healthy_with_zero_interval() {
        let (_, controller) = controller(Duration::from_millis(50));
        let server = StubServer::start().await;
        server.route("/health", 200, "ok");

        controller
            .wait_for_healthy(&server.url("/health"), Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap();

        let url = format!("http://127.0.0.1:{}/health", free_port());
        let err = controller
            .wait_for_healthy(&url, Duration::ZERO, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::StartupTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_healthy_times_out() {
        let (_, controller) = controller(Duration::from_millis(50));
        let url = format!("http://127.0.0.1:{}/health", free_port());

        let started = Instant::now();
        let err = controller
            .wait_for_healthy(&url, Duration::from_millis(50), Duration::from_millis(300))
            .await
            .unwrap_err();

        assert!(matches!(err, SupervisorError::StartupTimeout { .. }));
        assert!(err.to_string().contains("300ms"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_wait_for_healthy_fails_when_child_exits() {
        let (_, controller) = controller(Duration::from_millis(50));
        controller
            .spawn(&sh(), &script("exit 3"), &[], 7)
            .await
            .unwrap();

        let url = format!("http://127.0.0.1:{}/health", free_port());
        let err = controller
            .wait_for_healthy(&url, Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(err.to_string().contains("exited before becoming ready"));
    }
}
