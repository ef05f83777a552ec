//! Acquisition of the runtime binary and model artifact.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::download::{DownloadOptions, Downloader, ProgressFn};
use crate::error::{Result, SupervisorError};
use crate::model::ModelArtifact;
use crate::paths::{self, bin_dir, model_path, models_dir, runtime_binary_path, version_file};
use crate::release::{
    asset_name, load_version_record, write_version_record, ReleaseDescriptor, VersionRecord,
};

/// A runtime binary present on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRuntime {
    pub path: PathBuf,
    pub version: String,
    /// Whether this call downloaded it.
    pub downloaded: bool,
}

/// Keeps the runtime binary current and the model present.
///
/// Only one HTTP request is in flight at a time; [`cancel`](Self::cancel)
/// aborts it.
pub struct ArtifactPipeline {
    data_dir: PathBuf,
    release_url: String,
    asset_prefix: String,
    metadata_redirects: usize,
    download_redirects: usize,
    downloader: Downloader,
}

impl ArtifactPipeline {
    /// Create a pipeline rooted at `config.data_dir`.
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            release_url: config.release_url.clone(),
            asset_prefix: config.asset_prefix.clone(),
            metadata_redirects: config.metadata_redirects,
            download_redirects: config.download_redirects,
            downloader: Downloader::new(),
        }
    }

    /// Get the data root.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Abort the in-flight metadata fetch or download.
    pub fn cancel(&self) -> bool {
        self.downloader.cancel()
    }

    /// Cancel the in-flight request and refuse new ones until
    /// [`reopen`](Self::reopen).
    pub fn close(&self) {
        self.downloader.close();
    }

    /// Accept requests again after [`close`](Self::close).
    pub fn reopen(&self) {
        self.downloader.reopen();
    }

    /// Delete `.tmp` leftovers from a previous run. Returns how many were
    /// removed; failures are only logged.
    pub async fn cleanup_temp_files(&self) -> usize {
        let mut removed = 0;

        for dir in [bin_dir(&self.data_dir), models_dir(&self.data_dir)] {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!("Cannot scan {:?} for stale downloads: {}", dir, e);
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Error scanning {:?}: {}", dir, e);
                        break;
                    }
                };
                let path = entry.path();
                if !paths::is_temp_file(&path) {
                    continue;
                }
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        info!("Removed stale download {:?}", path);
                        removed += 1;
                    }
                    Err(e) => warn!("Failed to remove stale download {:?}: {}", path, e),
                }
            }
        }

        removed
    }

    /// Version recorded for the installed runtime, if any.
    pub async fn installed_version(&self) -> Option<String> {
        load_version_record(&version_file(&self.data_dir))
            .await
            .map(|record| record.version)
    }

    /// The installed runtime binary, when the record and the file agree.
    pub async fn installed_runtime(&self) -> Option<InstalledRuntime> {
        let version = self.installed_version().await?;
        let path = self.binary_path(&version);
        if !file_exists(&path).await {
            return None;
        }
        Some(InstalledRuntime {
            path,
            version,
            downloaded: false,
        })
    }

    /// Model files present in the models directory.
    pub fn list_installed_models(&self) -> Result<Vec<String>> {
        crate::model::list_installed(&models_dir(&self.data_dir))
    }

    /// Path the model artifact installs to.
    pub fn model_path(&self, model: &ModelArtifact) -> PathBuf {
        model_path(&self.data_dir, &model.filename)
    }

    fn binary_path(&self, version: &str) -> PathBuf {
        runtime_binary_path(&self.data_dir, &asset_name(&self.asset_prefix, version))
    }

    /// Make sure the installed runtime matches the latest release.
    ///
    /// Downloads only when the recorded version differs from the release tag
    /// or the binary has gone missing.
    pub async fn ensure_runtime_binary(&self, on_progress: ProgressFn<'_>) -> Result<InstalledRuntime> {
        let bin = bin_dir(&self.data_dir);
        tokio::fs::create_dir_all(&bin)
            .await
            .map_err(|e| SupervisorError::fs(&bin, e))?;

        let version_path = version_file(&self.data_dir);
        let local = load_version_record(&version_path).await;

        let release: ReleaseDescriptor = self
            .downloader
            .fetch_json(&self.release_url, self.metadata_redirects)
            .await?;
        debug!("Latest runtime release is {}", release.tag_name);

        if let Some(record) = &local {
            if record.version == release.tag_name {
                let path = self.binary_path(&release.tag_name);
                if file_exists(&path).await {
                    info!("Runtime {} is up to date", release.tag_name);
                    return Ok(InstalledRuntime {
                        path,
                        version: release.tag_name,
                        downloaded: false,
                    });
                }
                warn!(
                    "Runtime {} is recorded but {:?} is missing; reinstalling",
                    record.version, path
                );
            } else {
                info!(
                    "Runtime update available: {} -> {}",
                    record.version, release.tag_name
                );
            }
        }

        let asset = release.select_asset(&self.asset_prefix)?;
        let dest = runtime_binary_path(&self.data_dir, &asset.name);

        info!("Downloading runtime {} ({})", release.tag_name, asset.name);
        let options = DownloadOptions {
            known_size: asset.size,
            sha256: None,
            max_redirects: self.download_redirects,
        };
        self.downloader
            .download(&asset.browser_download_url, &dest, &options, on_progress)
            .await?;

        set_executable(&dest).await?;
        write_version_record(&version_path, &VersionRecord::new(&release.tag_name)).await?;
        self.prune_runtime_binaries(&dest).await;

        Ok(InstalledRuntime {
            path: dest,
            version: release.tag_name,
            downloaded: true,
        })
    }

    /// Make sure a complete copy of `model` is installed.
    pub async fn ensure_model_artifact(
        &self,
        model: &ModelArtifact,
        on_progress: ProgressFn<'_>,
    ) -> Result<PathBuf> {
        let dest = self.model_path(model);

        match tokio::fs::metadata(&dest).await {
            Ok(meta) if meta.is_file() && model.accepts_size(meta.len()) => {
                debug!("Model '{}' already installed at {:?}", model.name, dest);
                return Ok(dest);
            }
            Ok(meta) => warn!(
                "Model '{}' at {:?} is only {} bytes; downloading again",
                model.name,
                dest,
                meta.len()
            ),
            Err(_) => info!("Model '{}' not installed", model.name),
        }

        info!("Downloading model '{}' to {:?}", model.name, dest);
        let options = DownloadOptions {
            known_size: model.size_bytes,
            sha256: model.sha256.clone(),
            max_redirects: self.download_redirects,
        };
        let bytes = self
            .downloader
            .download(&model.url, &dest, &options, on_progress)
            .await?;

        if !model.accepts_size(bytes) {
            warn!(
                "Model '{}' is {} bytes, below the expected minimum of {}",
                model.name, bytes, model.min_bytes
            );
        }

        info!("Model '{}' downloaded successfully", model.name);
        Ok(dest)
    }

    /// Remove other runtime versions. Errors are logged and ignored.
    async fn prune_runtime_binaries(&self, keep: &Path) {
        let dir = bin_dir(&self.data_dir);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Skipping prune of {:?}: {}", dir, e);
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path == keep
                || name == paths::VERSION_FILE
                || paths::is_temp_file(&path)
                || !name.starts_with(&self.asset_prefix)
            {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!("Pruned old runtime {:?}", path),
                Err(e) => warn!("Failed to prune {:?}: {}", path, e),
            }
        }
    }
}

pub(crate) async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| SupervisorError::fs(path, e))
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
