//! Clean command - delete leftovers of interrupted downloads.

use warden_supervisor::{ArtifactPipeline, RuntimeConfig};

pub(crate) async fn run() -> miette::Result<()> {
    let config = RuntimeConfig::from_env();
    let pipeline = ArtifactPipeline::new(&config);

    match pipeline.cleanup_temp_files().await {
        0 => println!("No interrupted downloads found."),
        n => println!("Removed {} interrupted download(s).", n),
    }

    Ok(())
}
