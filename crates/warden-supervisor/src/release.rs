//! Release descriptors and the persisted runtime version record.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SupervisorError};
use crate::paths::temp_path;

/// Remote metadata describing the latest runtime release.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseDescriptor {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl ReleaseDescriptor {
    /// Asset name expected for this release: `{prefix}-{version}` with any
    /// leading `v` stripped from the tag.
    pub fn expected_asset_name(&self, prefix: &str) -> String {
        asset_name(prefix, &self.tag_name)
    }

    /// Select the asset matching `prefix` exactly.
    pub fn select_asset(&self, prefix: &str) -> Result<&ReleaseAsset> {
        let expected = self.expected_asset_name(prefix);
        self.assets
            .iter()
            .find(|asset| asset.name == expected)
            .ok_or_else(|| SupervisorError::AssetResolution {
                expected,
                available: self.assets.iter().map(|a| a.name.clone()).collect(),
            })
    }
}

/// Asset name for release `tag`: `{prefix}-{version}`, where `version` is
/// the tag without a leading `v`.
///
/// Runtime releases ship one portable executable for every OS, so the
/// asset name carries no platform suffix. The platform only shows in the
/// installed file name, which gets `EXE_SUFFIX` (see
/// [`runtime_binary_path`](crate::paths::runtime_binary_path)).
pub fn asset_name(prefix: &str, tag: &str) -> String {
    format!("{}-{}", prefix, tag.strip_prefix('v').unwrap_or(tag))
}

/// Installed runtime version, persisted as `version.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    pub updated: DateTime<Utc>,
}

impl VersionRecord {
    /// Record `version` as installed now.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            updated: Utc::now(),
        }
    }
}

/// Read the version record.
///
/// A missing file is `Ok(None)`; unparseable content is
/// [`SupervisorError::VersionMetadataCorrupt`].
pub async fn read_version_record(path: &Path) -> Result<Option<VersionRecord>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SupervisorError::fs(path, e)),
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| SupervisorError::VersionMetadataCorrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Read the version record, treating any failure as a cache miss.
pub async fn load_version_record(path: &Path) -> Option<VersionRecord> {
    match read_version_record(path).await {
        Ok(record) => record,
        Err(e) => {
            warn!("Ignoring runtime version record: {}", e);
            None
        }
    }
}

/// Persist the version record via temp file and rename.
pub async fn write_version_record(path: &Path, record: &VersionRecord) -> Result<()> {
    let content = serde_json::to_string_pretty(record)?;
    let tmp = temp_path(path);

    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| SupervisorError::fs(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| SupervisorError::fs(path, e))?;

    debug!("Recorded runtime version {}", record.version);
    Ok(())
}
