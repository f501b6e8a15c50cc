use super::{modified_millis, InspectedState, Retrieval, StateBackend, StoredAnalysis};
use crate::codec::DocumentEncoder;
use crate::config::BackendKind;
use crate::error::Result;
use crate::state::{AllAnalysesStates, StatePair, SweepReport};
use crate::store::ObjectStore;
use capflow_types::{AnalysisId, EntityId};
use parking_lot::RwLock;
use std::sync::Arc;

/// Backend whose in-memory index is the persisted object graph
pub struct DelegatingBackend {
    states: RwLock<AllAnalysesStates>,
    store: Arc<dyn ObjectStore>,
}

impl DelegatingBackend {
    pub fn open(store: Arc<dyn ObjectStore>) -> Result<Self> {
        let states = AllAnalysesStates::open(store.clone())?;
        Ok(Self {
            states: RwLock::new(states),
            store,
        })
    }

    /// Read access to the index
    pub fn with_states<R>(&self, f: impl FnOnce(&AllAnalysesStates) -> R) -> R {
        f(&self.states.read())
    }
}

impl StateBackend for DelegatingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    fn load(&self) -> Result<()> {
        let reloaded = AllAnalysesStates::open(self.store.clone())?;
        *self.states.write() = reloaded;
        Ok(())
    }

    fn retrieve(&self, request: &Retrieval<'_>) -> Result<StatePair> {
        let script_modified = if request.force_reset {
            i64::MAX
        } else {
            modified_millis(request.script_path)?
        };
        self.states.write().make_analysis_state(
            request.analysis_id,
            request.entity_id,
            script_modified,
            request.now,
        )
    }

    fn save(&self, analysis_id: &AnalysisId, entity_id: &EntityId, pair: StatePair) -> Result<()> {
        self.states
            .write()
            .save_analysis_state(analysis_id, entity_id, pair)?;
        Ok(())
    }

    fn sweep(&self, now: i64) -> Result<SweepReport> {
        self.states.write().purge_expired(now)
    }

    fn shutdown(&self) -> Result<()> {
        self.states.write().close()
    }

    fn inspect(
        &self,
        analysis_id: &AnalysisId,
        entity_id: Option<&EntityId>,
        _now: i64,
    ) -> Result<Option<InspectedState>> {
        let states = self.states.read();
        let Some(constants) = states.constants(analysis_id) else {
            return Ok(None);
        };
        let encoder = DocumentEncoder::new();
        let entity_state = entity_id
            .and_then(|entity_id| states.variables(analysis_id, entity_id))
            .map(|variables| encoder.encode(variables.values()));
        Ok(Some(InspectedState {
            analysis_state: encoder.encode(constants.values()),
            entity_state,
        }))
    }

    fn list(&self) -> Result<Vec<StoredAnalysis>> {
        let states = self.states.read();
        let index = states.index();
        let mut analyses: Vec<StoredAnalysis> = index
            .constants
            .keys()
            .map(|analysis_id| {
                let mut entities: Vec<EntityId> = index
                    .variables
                    .get(analysis_id)
                    .map(|entities| entities.keys().cloned().collect())
                    .unwrap_or_default();
                entities.sort();
                StoredAnalysis {
                    analysis_id: analysis_id.clone(),
                    entities,
                }
            })
            .collect();
        analyses.sort_by(|a, b| a.analysis_id.cmp(&b.analysis_id));
        Ok(analyses)
    }
}
