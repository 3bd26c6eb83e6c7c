//! Startup checks module
//!
//! Provides preflight checks to verify the environment before starting the daemon:
//! - Watched root exists and is a directory
//! - Correction launcher is found and executable
//! - Correction script exists

use crate::config::Config;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Watch root not usable: {0}")]
    WatchRoot(String),

    #[error("Correction launcher not available: {0}")]
    LauncherUnavailable(String),

    #[error("Correction script not found: {0}")]
    ScriptMissing(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Check the watched root
pub fn check_watch_root(root: &Path) -> Result<(), StartupError> {
    let metadata = std::fs::metadata(root).map_err(|e| {
        StartupError::WatchRoot(format!("{}: {}", root.display(), e))
    })?;
    if !metadata.is_dir() {
        return Err(StartupError::WatchRoot(format!(
            "{} is not a directory",
            root.display()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Resolve a launcher the way the OS would
///
/// Paths with a separator are taken as is, bare names are looked up in `PATH`.
pub fn resolve_launcher(launcher: &Path) -> Option<PathBuf> {
    if launcher.components().count() > 1 {
        return is_executable(launcher).then(|| launcher.to_path_buf());
    }
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(launcher))
        .find(|candidate| is_executable(candidate))
}

/// Check that the Fiji launcher can be started
pub fn check_launcher_available(launcher: &Path) -> Result<(), StartupError> {
    if resolve_launcher(launcher).is_none() {
        return Err(StartupError::LauncherUnavailable(format!(
            "{} is not an executable file; set correction.launcher or FIJI_LAUNCHER",
            launcher.display()
        )));
    }
    Ok(())
}

/// Check that the groovy script exists
pub fn check_script_present(script: &Path) -> Result<(), StartupError> {
    if !script.is_file() {
        return Err(StartupError::ScriptMissing(script.display().to_string()));
    }
    Ok(())
}

/// Run all startup checks
///
/// Checks are run in the following order:
/// 1. Watched root
/// 2. Launcher
/// 3. Script
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let root = cfg
        .watch_root()
        .map_err(|e| StartupError::Config(e.to_string()))?;
    check_watch_root(root)?;
    check_launcher_available(&cfg.correction.launcher)?;
    check_script_present(&cfg.correction.script)?;
    Ok(())
}
