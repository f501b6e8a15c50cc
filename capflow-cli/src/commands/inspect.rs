//! Read-only views of stored state.

use super::open;
use anyhow::{bail, Context, Result};
use capflow_core::{Clock, SystemClock};
use capflow_types::{AnalysisId, EntityId};
use std::path::Path;

/// Print the stored state of `analysis` (and optionally one entity) as JSON
pub fn inspect_state(
    config_path: &Path,
    analysis: &str,
    entity: Option<&str>,
    pretty: bool,
) -> Result<()> {
    let (_, backend) = open(config_path)?;
    let analysis_id = AnalysisId::new(analysis);
    let entity_id = entity.map(EntityId::new);

    let Some(inspected) = backend
        .inspect(&analysis_id, entity_id.as_ref(), SystemClock.now_millis())
        .with_context(|| format!("Failed to read state of analysis {}", analysis))?
    else {
        bail!("No stored state for analysis {}", analysis);
    };
    if entity_id.is_some() && inspected.entity_state.is_none() {
        tracing::warn!("No stored state for entity {}", entity.unwrap_or_default());
    }

    let rendered = if pretty {
        serde_json::to_string_pretty(&inspected)?
    } else {
        serde_json::to_string(&inspected)?
    };
    println!("{}", rendered);
    Ok(())
}

/// Print every analysis with stored state
pub fn list_states(config_path: &Path, json: bool) -> Result<()> {
    let (_, backend) = open(config_path)?;
    let analyses = backend.list().context("Failed to list stored state")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&analyses)?);
        return Ok(());
    }
    if analyses.is_empty() {
        println!("No stored analysis state");
        return Ok(());
    }
    for stored in &analyses {
        println!("{} ({} entities)", stored.analysis_id, stored.entities.len());
        for entity_id in &stored.entities {
            println!("  {}", entity_id);
        }
    }
    Ok(())
}
