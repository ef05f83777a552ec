//! Path utilities for Warden data directories.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// File name of the persisted runtime version record.
pub const VERSION_FILE: &str = "version.json";

/// Suffix used for in-progress downloads.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Get the default Warden data directory.
///
/// Uses the platform's local data directory, falling back to `~/.warden`
/// and finally to the working directory.
pub fn warden_data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_local_dir() {
        return dir.join("warden");
    }
    dirs::home_dir()
        .map(|home| home.join(".warden"))
        .unwrap_or_else(|| PathBuf::from(".warden"))
}

/// Directory holding installed runtime binaries and `version.json`.
pub fn bin_dir(root: &Path) -> PathBuf {
    root.join("bin")
}

/// Directory holding model files.
pub fn models_dir(root: &Path) -> PathBuf {
    root.join("models")
}

/// Get the path to the runtime version record.
pub fn version_file(root: &Path) -> PathBuf {
    bin_dir(root).join(VERSION_FILE)
}

/// Get the installed path of a runtime binary for a release asset.
pub fn runtime_binary_path(root: &Path, asset_name: &str) -> PathBuf {
    bin_dir(root).join(executable_name(asset_name))
}

/// Get the path to a model file.
pub fn model_path(root: &Path, filename: &str) -> PathBuf {
    models_dir(root).join(filename)
}

/// Append the platform executable suffix (`.exe` on Windows).
pub fn executable_name(stem: &str) -> String {
    format!("{}{}", stem, std::env::consts::EXE_SUFFIX)
}

/// Sibling path used while `path` is being downloaded.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Whether a directory entry is a leftover download.
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path_is_sibling() {
        let path = Path::new("/data/bin/llamafile-5");
        assert_eq!(temp_path(path), PathBuf::from("/data/bin/llamafile-5.tmp"));
        assert!(is_temp_file(&temp_path(path)));
        assert!(!is_temp_file(path));
    }

    #[test]
    fn test_layout() {
        let root = Path::new("/data");
        assert_eq!(version_file(root), PathBuf::from("/data/bin/version.json"));
        assert_eq!(
            model_path(root, "model.gguf"),
            PathBuf::from("/data/models/model.gguf")
        );
        assert!(runtime_binary_path(root, "llamafile-5")
            .to_string_lossy()
            .starts_with("/data/bin/llamafile-5"));
    }
}
