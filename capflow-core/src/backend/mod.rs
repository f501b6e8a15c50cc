//! Persistence backends
//!
//! Two interchangeable implementations of [`StateBackend`] are selected at
//! startup from [`BackendKind`]:
//!
//! - [`DelegatingBackend`] keeps the whole [`AllAnalysesStates`] index in
//!   memory and hands writes to an [`ObjectStore`].
//! - [`FileBackend`] keeps one JSON document per analysis and per entity and
//!   detects stale state from file and script modification times.
//!
//! [`AllAnalysesStates`]: crate::state::AllAnalysesStates

mod delegating;
mod file;

pub use delegating::DelegatingBackend;
pub use file::FileBackend;

use crate::clock::system_time_millis;
use crate::config::{BackendKind, CapflowConfig};
use crate::error::{Result, StateError};
use crate::state::{StatePair, SweepReport};
use crate::store::SnapshotStore;
use capflow_types::{AnalysisId, EntityId};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Everything a backend needs to produce the state pair for one request
#[derive(Debug, Clone, Copy)]
pub struct Retrieval<'a> {
    pub script_path: &'a Path,
    pub analysis_id: &'a AnalysisId,
    pub entity_id: &'a EntityId,
    /// Discard stored state regardless of its age
    pub force_reset: bool,
    pub now: i64,
}

/// Stored state rendered as plain JSON
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectedState {
    pub analysis_state: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_state: Option<serde_json::Value>,
}

/// An analysis with stored state and the entities it has state for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredAnalysis {
    pub analysis_id: AnalysisId,
    pub entities: Vec<EntityId>,
}

/// Load, retrieve and save analysis state
pub trait StateBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// (Re)load persisted state
    fn load(&self) -> Result<()>;

    /// The state pair for one request; stored state counts one more event
    fn retrieve(&self, request: &Retrieval<'_>) -> Result<StatePair>;

    /// Persist the state pair produced by a successful run
    fn save(&self, analysis_id: &AnalysisId, entity_id: &EntityId, pair: StatePair) -> Result<()>;

    /// Remove expired entity and analysis state
    fn sweep(&self, now: i64) -> Result<SweepReport>;

    /// Flush and stop accepting writes
    fn shutdown(&self) -> Result<()>;

    /// Stored state of an analysis (and optionally one entity) without side effects
    fn inspect(
        &self,
        analysis_id: &AnalysisId,
        entity_id: Option<&EntityId>,
        now: i64,
    ) -> Result<Option<InspectedState>>;

    fn list(&self) -> Result<Vec<StoredAnalysis>>;
}

/// Modification time of `path` in epoch milliseconds
pub fn modified_millis(path: &Path) -> Result<i64> {
    let modified = std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map_err(|e| StateError::io(path, e))?;
    Ok(system_time_millis(modified))
}

/// Build the backend named by `config`
pub fn open_backend(config: &CapflowConfig) -> Result<Arc<dyn StateBackend>> {
    let backend: Arc<dyn StateBackend> = match config.backend {
        BackendKind::ObjectStore => {
            let store = Arc::new(SnapshotStore::new(config.snapshot_dir()));
            Arc::new(DelegatingBackend::open(store)?)
        }
        BackendKind::File => {
            let backend = FileBackend::new(config.state_dir());
            backend.load()?;
            Arc::new(backend)
        }
    };
    info!(backend = %config.backend, "Opened state backend");
    Ok(backend)
}
