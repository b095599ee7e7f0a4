//! Configuration file loading.
//!
//! Loads pyexec configuration from TOML files at XDG-compliant locations.

use crate::config::types::PyExecConfig;
use crate::error::PoolError;
use std::path::{Path, PathBuf};

/// Default configuration file name for project-local config.
const LOCAL_CONFIG_NAME: &str = "pyexec.toml";

/// Default configuration file name within XDG config directory.
const XDG_CONFIG_NAME: &str = "config.toml";

/// Application name for XDG directory lookup.
const APP_NAME: &str = "pyexec";

/// Loads configuration from the default search paths.
///
/// Search order:
/// 1. `./pyexec.toml` (project-local)
/// 2. `~/.config/pyexec/config.toml` (XDG config)
///
/// Returns the default configuration if no config file is found.
///
/// # Errors
///
/// Returns an error if a config file exists but cannot be parsed.
pub fn load() -> Result<PyExecConfig, PoolError> {
    for path in search_paths() {
        if path.exists() {
            return from_path(&path);
        }
    }
    Ok(PyExecConfig::default())
}

/// Loads configuration from a specific file path.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read
/// - The file contains invalid TOML
/// - The TOML doesn't match the expected schema
pub fn from_path(path: &Path) -> Result<PyExecConfig, PoolError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        PoolError::invalid_config(
            "config_file",
            format!("failed to read '{}': {e}", path.display()),
        )
    })?;

    from_str(&contents).map_err(|e| {
        PoolError::invalid_config(
            "config_file",
            format!("failed to parse '{}': {e}", path.display()),
        )
    })
}

/// Parses configuration from a TOML string.
///
/// # Errors
///
/// Returns an error if the TOML is invalid or doesn't match the schema.
pub fn from_str(toml_str: &str) -> Result<PyExecConfig, PoolError> {
    toml::from_str(toml_str)
        .map_err(|e| PoolError::invalid_config("config", format!("invalid TOML: {e}")))
}

/// Returns the paths that would be searched for configuration files.
#[must_use]
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(LOCAL_CONFIG_NAME)];

    if let Some(dir) = xdg_config_dir() {
        paths.push(dir.join(XDG_CONFIG_NAME));
    }

    paths
}

/// Returns the XDG config directory for pyexec (`~/.config/pyexec`).
#[must_use]
pub fn xdg_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_NAME))
}
