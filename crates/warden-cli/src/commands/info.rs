//! Info command - show paths, installed artifacts and ports.

use warden_supervisor::paths;
use warden_supervisor::{ArtifactPipeline, BackendConfig, RuntimeConfig};

pub(crate) async fn run(json: bool) -> miette::Result<()> {
    let runtime = RuntimeConfig::from_env();
    let backend = BackendConfig::from_env();
    let pipeline = ArtifactPipeline::new(&runtime);

    let installed = pipeline.installed_runtime().await;
    let models = pipeline
        .list_installed_models()
        .map_err(|e| miette::miette!("Failed to list models: {}", e))?;
    let model_installed = models.contains(&runtime.model.filename);

    if json {
        let info = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": runtime.data_dir,
            "bin_dir": paths::bin_dir(&runtime.data_dir),
            "models_dir": paths::models_dir(&runtime.data_dir),
            "runtime": {
                "version": installed.as_ref().map(|r| r.version.clone()),
                "path": installed.as_ref().map(|r| r.path.clone()),
                "port": runtime.port,
                "release_url": runtime.release_url,
            },
            "model": {
                "name": runtime.model.name,
                "filename": runtime.model.filename,
                "installed": model_installed,
            },
            "installed_models": models,
            "backend": {
                "executable": paths::executable_name(&backend.executable),
                "port": backend.port,
            },
        });
        let output = serde_json::to_string_pretty(&info)
            .map_err(|e| miette::miette!("Failed to serialize info: {}", e))?;
        println!("{}", output);
        return Ok(());
    }

    println!("Warden {}", env!("CARGO_PKG_VERSION"));
    println!("==========");
    println!();
    println!("Data directory:   {}", runtime.data_dir.display());
    println!(
        "Models directory: {}",
        paths::models_dir(&runtime.data_dir).display()
    );
    println!(
        "Binaries:         {}",
        paths::bin_dir(&runtime.data_dir).display()
    );
    println!();

    match &installed {
        Some(installed) => {
            println!("Runtime:          {}", installed.version);
            println!("  Path: {}", installed.path.display());
        }
        None => println!("Runtime:          not installed"),
    }
    println!("  Port: {}", runtime.port);
    println!();

    println!("Default model:    {}", runtime.model.filename);
    println!("  Installed: {}", model_installed);
    if !models.is_empty() {
        println!("Installed models:");
        for model in &models {
            println!("  - {}", model);
        }
    }
    println!();

    println!(
        "Backend:          {} (port {})",
        paths::executable_name(&backend.executable),
        backend.port
    );

    Ok(())
}
