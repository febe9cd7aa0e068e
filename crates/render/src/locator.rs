//! Stabilizer executable discovery and preflight
//!
//! Resolution order:
//! 1. user-configured override path
//! 2. `STABILIZER_PATH` environment variable
//! 3. PATH lookup for the default executable name
//! 4. well-known platform install locations

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

/// Default executable name looked up on PATH
pub const DEFAULT_EXECUTABLE: &str = "gyroflow";

/// Environment variable naming the executable
pub const STABILIZER_PATH_ENV: &str = "STABILIZER_PATH";

/// Error type for the preflight check
#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("Stabilizer not available: {0}")]
    Unavailable(String),
}

fn existing_file(path: &Path) -> Option<PathBuf> {
    path.is_file().then(|| path.to_path_buf())
}

/// Install locations searched when nothing else resolved.
fn platform_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    #[cfg(windows)]
    {
        for var in ["LOCALAPPDATA", "ProgramFiles", "ProgramFiles(x86)"] {
            if let Some(base) = env::var_os(var) {
                let base = PathBuf::from(base);
                candidates.push(base.join("Gyroflow").join("gyroflow.exe"));
                candidates.push(base.join("Programs").join("Gyroflow").join("gyroflow.exe"));
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        candidates.push(PathBuf::from("/Applications/Gyroflow.app/Contents/MacOS/gyroflow"));
        if let Some(home) = env::var_os("HOME") {
            candidates.push(
                PathBuf::from(home).join("Applications/Gyroflow.app/Contents/MacOS/gyroflow"),
            );
        }
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        candidates.push(PathBuf::from("/opt/Gyroflow/gyroflow"));
        candidates.push(PathBuf::from("/usr/share/gyroflow/gyroflow"));
        candidates.push(PathBuf::from("/var/lib/flatpak/exports/bin/xyz.gyroflow"));
        if let Some(home) = env::var_os("HOME") {
            candidates.push(
                PathBuf::from(home).join(".local/share/flatpak/exports/bin/xyz.gyroflow"),
            );
        }
    }

    candidates
}

/// Resolve the stabilizer executable.
///
/// Returns `None` when no step finds an existing file. Callers surface that
/// as an executable-not-found failure instead of running anything.
pub fn locate_stabilizer(override_path: Option<&Path>) -> Option<PathBuf> {
    resolve(
        override_path,
        env::var_os(STABILIZER_PATH_ENV).map(PathBuf::from),
        || which::which(DEFAULT_EXECUTABLE).ok(),
        platform_candidates(),
    )
}

fn resolve(
    override_path: Option<&Path>,
    env_path: Option<PathBuf>,
    search_path: impl FnOnce() -> Option<PathBuf>,
    candidates: Vec<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = override_path {
        if let Some(found) = existing_file(path) {
            debug!(path = %found.display(), "stabilizer resolved from configured path");
            return Some(found);
        }
        info!(path = %path.display(), "configured stabilizer path does not exist, searching");
    }

    if let Some(found) = env_path.and_then(|p| existing_file(&p)) {
        debug!(path = %found.display(), "stabilizer resolved from {}", STABILIZER_PATH_ENV);
        return Some(found);
    }

    if let Some(found) = search_path() {
        debug!(path = %found.display(), "stabilizer resolved from PATH");
        return Some(found);
    }

    let found = candidates.into_iter().find(|p| p.is_file());
    if let Some(path) = &found {
        debug!(path = %path.display(), "stabilizer resolved from install location");
    }
    found
}

/// Check that the stabilizer runs by calling `<exe> --version`.
pub fn check_stabilizer_available(executable: &Path) -> Result<String, LocatorError> {
    let output = Command::new(executable)
        .arg("--version")
        .output()
        .map_err(|e| {
            LocatorError::Unavailable(format!(
                "{} --version failed; is the stabilizer installed? Error: {}",
                executable.display(),
                e
            ))
        })?;

    if !output.status.success() {
        return Err(LocatorError::Unavailable(format!(
            "{} --version exited with {}",
            executable.display(),
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
