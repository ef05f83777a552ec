//! Serve command - run the backend and the runtime until Ctrl-C.

use std::path::Path;

use warden_supervisor::{
    BackendConfig, BackendServiceSupervisor, RuntimeConfig, RuntimeServiceSupervisor,
    RuntimeState, StatusReporter,
};

pub(crate) async fn run(resources_dir: &Path, no_runtime: bool) -> miette::Result<()> {
    let backend = BackendServiceSupervisor::new(BackendConfig::from_env());
    let runtime = RuntimeServiceSupervisor::new(RuntimeConfig::from_env());

    if let Err(e) = backend.start(resources_dir).await {
        backend.stop().await;
        return Err(miette::miette!("Failed to start backend: {}", e));
    }
    if let Some(port) = backend.port() {
        println!("Backend ready on http://127.0.0.1:{}", port);
    }

    let interrupted = {
        let setup = runtime.setup();
        tokio::pin!(setup);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        let mut setup_done = no_runtime;

        let interrupted = loop {
            tokio::select! {
                result = &mut shutdown => break result,
                _ = &mut setup, if !setup_done => {
                    setup_done = true;
                    report_runtime(&runtime);
                }
            }
        };

        println!();
        println!("Shutting down...");
        if setup_done {
            runtime.stop().await;
        } else {
            // Setup keeps running until stop() cancels it, so a partial
            // download gets to remove its temp file.
            tokio::join!(runtime.stop(), &mut setup);
        }
        interrupted
    };

    backend.stop().await;

    interrupted.map_err(|e| miette::miette!("Failed to wait for Ctrl-C: {}", e))
}

fn report_runtime(runtime: &RuntimeServiceSupervisor) {
    let status = runtime.status();
    match &status.state {
        RuntimeState::Ready => println!(
            "Local inference runtime {} ready on http://127.0.0.1:{}",
            status.runtime_version.as_deref().unwrap_or("(unknown)"),
            status.port.unwrap_or(runtime.config().port)
        ),
        RuntimeState::Error { message } => {
            eprintln!("Local inference unavailable: {}", message);
        }
        other => println!("Local inference runtime is {}", other.label()),
    }
    println!("Press Ctrl-C to stop.");
}
