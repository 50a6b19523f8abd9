//! Log directory and log file discovery.
//!
//! VRChat writes one `output_log_<timestamp>.txt` per game session into its
//! LocalLow data directory.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Environment variable overriding the log directory.
pub const ENV_LOG_DIR: &str = "VRCLOG_LOGDIR";

const LOG_FILE_PREFIX: &str = "output_log_";
const LOG_FILE_SUFFIX: &str = ".txt";

/// Errors from log directory and log file lookup.
#[derive(thiserror::Error, Debug)]
pub enum LogFinderError {
    /// No usable log directory.
    #[error("log directory not found: {0}")]
    LogDirNotFound(String),

    /// The directory holds no `output_log_*.txt` files.
    #[error("no log files found in {}", .0.display())]
    NoLogFiles(PathBuf),

    /// The directory could not be read.
    #[error("I/O error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Whether a file name follows the `output_log_*.txt` pattern.
#[must_use]
pub fn is_log_file_name(name: &str) -> bool {
    name.starts_with(LOG_FILE_PREFIX) && name.ends_with(LOG_FILE_SUFFIX)
}

/// Candidate log directories for this platform, in priority order.
#[must_use]
pub fn default_log_dirs() -> Vec<PathBuf> {
    platform_log_dirs()
}

// LocalLow sits next to %LOCALAPPDATA%.
#[cfg(windows)]
fn platform_log_dirs() -> Vec<PathBuf> {
    dirs::data_local_dir()
        .as_deref()
        .and_then(Path::parent)
        .map(|p| p.join("LocalLow").join("VRChat"))
        .map(|base| vec![base.join("VRChat"), base.join("vrchat")])
        .unwrap_or_default()
}

// Steam Proton prefix for app 438100.
#[cfg(not(windows))]
fn platform_log_dirs() -> Vec<PathBuf> {
    dirs::home_dir()
        .map(|home| {
            home.join(".steam/steam/steamapps/compatdata/438100/pfx")
                .join("drive_c/users/steamuser/AppData/LocalLow/VRChat")
        })
        .map(|base| vec![base.join("VRChat"), base.join("vrchat")])
        .unwrap_or_default()
}

/// Find the log directory.
///
/// Priority: `explicit`, then the `VRCLOG_LOGDIR` environment variable, then
/// [`default_log_dirs`]. A directory only counts if it contains at least one
/// log file. The returned path has symlinks resolved.
///
/// # Errors
///
/// Returns `LogFinderError::LogDirNotFound` if no candidate is valid.
pub fn find_log_dir(explicit: Option<&Path>) -> Result<PathBuf, LogFinderError> {
    find_log_dir_from(
        explicit,
        std::env::var_os(ENV_LOG_DIR),
        &default_log_dirs(),
    )
}

fn find_log_dir_from(
    explicit: Option<&Path>,
    env: Option<OsString>,
    candidates: &[PathBuf],
) -> Result<PathBuf, LogFinderError> {
    if let Some(dir) = explicit.filter(|d| !d.as_os_str().is_empty()) {
        return resolve_log_dir(dir).ok_or_else(|| {
            LogFinderError::LogDirNotFound(format!(
                "{} is not a directory or contains no log files",
                dir.display()
            ))
        });
    }

    if let Some(dir) = env.filter(|d| !d.is_empty()) {
        return resolve_log_dir(Path::new(&dir)).ok_or_else(|| {
            LogFinderError::LogDirNotFound(format!(
                "{ENV_LOG_DIR} points to an invalid directory"
            ))
        });
    }

    candidates
        .iter()
        .find_map(|dir| resolve_log_dir(dir))
        .ok_or_else(|| LogFinderError::LogDirNotFound("no default location found".to_string()))
}

/// Resolve symlinks and check the directory holds log files.
fn resolve_log_dir(dir: &Path) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    let resolved = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    match log_files_with_mtime(&resolved) {
        Ok(files) if !files.is_empty() => Some(resolved),
        _ => None,
    }
}

fn log_files_with_mtime(dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>, LogFinderError> {
    let entries = std::fs::read_dir(dir).map_err(|source| LogFinderError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    Ok(entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(is_log_file_name)
        })
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            let modified = metadata.modified().ok()?;
            Some((entry.path(), modified))
        })
        .collect())
}

/// Find the most recently modified log file in a directory.
///
/// Ties on modification time are broken by file name, which embeds the
/// session start time.
///
/// # Errors
///
/// Returns `LogFinderError::NoLogFiles` if there is no log file, or
/// `LogFinderError::Io` if the directory cannot be read.
pub fn find_latest_log_file(dir: &Path) -> Result<PathBuf, LogFinderError> {
    log_files_with_mtime(dir)?
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
        .map(|(path, _)| path)
        .ok_or_else(|| LogFinderError::NoLogFiles(dir.to_path_buf()))
}

/// List all log files in a directory, oldest first.
///
/// # Errors
///
/// Returns `LogFinderError::Io` if the directory cannot be read.
pub fn list_log_files(dir: &Path) -> Result<Vec<PathBuf>, LogFinderError> {
    let mut files = log_files_with_mtime(dir)?;
    files.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    Ok(files.into_iter().map(|(path, _)| path).collect())
}
