//! CLI command implementations.

pub mod inspect;
pub mod sweep;

pub use inspect::{inspect_state, list_states};
pub use sweep::{sweep_once, watch_sweeps};

use anyhow::{Context, Result};
use capflow_core::{open_backend, CapflowConfig, StateBackend};
use std::path::Path;
use std::sync::Arc;

/// Load the config, falling back to defaults when the file does not exist
pub(crate) fn load_config(config_path: &Path) -> Result<CapflowConfig> {
    if !config_path.exists() {
        tracing::debug!("No config at {:?}, using defaults", config_path);
        return Ok(CapflowConfig::default());
    }
    tracing::debug!("Loading config from {:?}", config_path);
    CapflowConfig::from_file(config_path).context("Failed to load configuration")
}

pub(crate) fn open(config_path: &Path) -> Result<(CapflowConfig, Arc<dyn StateBackend>)> {
    let config = load_config(config_path)?;
    let backend = open_backend(&config).context("Failed to open state backend")?;
    Ok((config, backend))
}
