//! Setup command - acquire the runtime and model with a progress bar.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use warden_supervisor::{
    DownloadProgress, RuntimeConfig, RuntimeServiceSupervisor, RuntimeState, RuntimeStatus,
};

pub(crate) async fn run() -> miette::Result<()> {
    let supervisor = RuntimeServiceSupervisor::new(RuntimeConfig::from_env());
    let mut updates = supervisor.subscribe();

    println!("Setting up the local inference runtime");
    println!(
        "Data directory: {}",
        supervisor.config().data_dir.display()
    );
    println!();

    let bar = ProgressBar::new_spinner();
    bar.enable_steady_tick(Duration::from_millis(120));

    {
        let setup = supervisor.setup();
        tokio::pin!(setup);
        loop {
            tokio::select! {
                _ = &mut setup => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = updates.borrow_and_update().clone();
                    render(&bar, &status);
                }
            }
        }
    }
    bar.finish_and_clear();

    let status = supervisor.get_status();
    supervisor.stop().await;

    match status.state {
        RuntimeState::Ready => {
            println!(
                "Runtime {} is installed and answered on port {}.",
                status.runtime_version.as_deref().unwrap_or("(unknown)"),
                status.port.unwrap_or(supervisor.config().port)
            );
            println!("Run `warden serve` to keep it running.");
            Ok(())
        }
        RuntimeState::Error { message } => Err(miette::miette!("Setup failed: {}", message)),
        other => Err(miette::miette!("Setup ended in state '{}'", other.label())),
    }
}

fn render(bar: &ProgressBar, status: &RuntimeStatus) {
    match &status.state {
        RuntimeState::DownloadingRuntime { progress } => show_download(bar, "runtime", progress),
        RuntimeState::DownloadingModel { progress } => show_download(bar, "model", progress),
        RuntimeState::Starting => {
            bar.set_style(spinner_style());
            bar.set_message("Starting runtime...");
        }
        _ => {}
    }
}

fn show_download(bar: &ProgressBar, what: &str, progress: &DownloadProgress) {
    match progress.bytes_total {
        Some(total) => {
            bar.set_style(bar_style());
            bar.set_length(total);
        }
        None => bar.set_style(spinner_style()),
    }
    bar.set_message(format!("Downloading {}", what));
    bar.set_position(progress.bytes_downloaded);
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg} {bytes}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
