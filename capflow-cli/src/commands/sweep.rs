//! Expiry sweeps from the command line.

use super::open;
use anyhow::{Context, Result};
use capflow_core::{Clock, SystemClock};
use capflow_runtime::{SweepFn, Sweeper};
use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;

/// Run one sweep pass now
pub fn sweep_once(config_path: &Path) -> Result<()> {
    let (_, backend) = open(config_path)?;
    let now = SystemClock.now_millis();
    let report = backend.sweep(now).context("Failed to sweep state")?;
    backend.shutdown().context("Failed to flush state")?;

    let at = Utc
        .timestamp_millis_opt(now)
        .single()
        .map(|at| at.to_rfc3339())
        .unwrap_or_default();
    println!(
        "Swept at {}: removed {} entities, {} analyses",
        at, report.removed_entities, report.removed_analyses
    );
    Ok(())
}

/// Sweep at the configured interval until Ctrl-C
pub async fn watch_sweeps(config_path: &Path) -> Result<()> {
    let (config, backend) = open(config_path)?;
    let sweep: SweepFn = {
        let backend = backend.clone();
        Arc::new(move || backend.sweep(SystemClock.now_millis()).map(Some))
    };
    let sweeper = Sweeper::spawn(config.purge_interval(), sweep);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    sweeper.stop().await;

    tokio::task::spawn_blocking(move || backend.shutdown())
        .await
        .context("Flush task failed")?
        .context("Failed to flush state")?;
    Ok(())
}
