//! Analysis state lifecycle
//!
//! Each analysis owns one constant [`AnalysisState`], shared by all of its
//! entities, and one variable state per entity. [`AllAnalysesStates`] is the
//! process-wide index of both. It decides when state must be created,
//! reinitialized because the analysis script changed, or reused, and it
//! persists each change through an [`ObjectStore`] with the smallest write
//! that covers it.

use crate::collection::ValueMap;
use crate::error::{Result, StateError};
use crate::store::{ObjectStore, StoreTarget};
use crate::value::Value;
use capflow_types::{AnalysisId, EntityId, Mutability};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reserved variable entry counting the events seen for an entity
pub const NUMBER_EVENTS: &str = "*numberEvents*";

/// Reserved variable entry holding the time of the current event
pub const NOW: &str = "*now*";

/// Reserved constant entry: milliseconds after which idle entity state expires
pub const EXPIRES: &str = "*expires*";

/// Increment the event counter and refresh `*now*`
///
/// Returns false, leaving `values` untouched, if there is no numeric counter.
pub fn bump_event_counter(values: &mut ValueMap, now: i64) -> bool {
    let Some(counter) = values.get_mut(NUMBER_EVENTS) else {
        return false;
    };
    let Some(count) = counter.as_number() else {
        return false;
    };
    *counter = Value::number(count + 1.0);
    values.insert(NOW, Value::number(now as f64));
    true
}

/// Named values of one scope plus change tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisState {
    values: ValueMap,
    last_change: i64,

    /// Set until the state has been written to the index once
    #[serde(skip)]
    is_new: bool,
}

impl AnalysisState {
    /// Fresh state; variable state is seeded with the event counter and time
    pub fn new(scope: Mutability, now: i64) -> Self {
        let mut state = Self {
            values: ValueMap::new(),
            last_change: now,
            is_new: true,
        };
        state.reinitialize(scope, now);
        state
    }

    /// Existing state rebuilt from stored values
    pub fn from_values(values: ValueMap, last_change: i64) -> Self {
        Self {
            values,
            last_change,
            is_new: false,
        }
    }

    /// Clear all values and restart the change clock
    pub fn reinitialize(&mut self, scope: Mutability, now: i64) {
        self.values.clear();
        self.last_change = now;
        if scope == Mutability::Variable {
            self.values.insert(NUMBER_EVENTS, Value::number(1.0));
            self.values.insert(NOW, Value::number(now as f64));
        }
    }

    /// Count one more event at `now`
    pub fn record_event(&mut self, now: i64) {
        if !bump_event_counter(&mut self.values, now) {
            warn!("Event counter missing from variable state, reseeding");
            self.values.insert(NUMBER_EVENTS, Value::number(1.0));
            self.values.insert(NOW, Value::number(now as f64));
        }
        self.last_change = now;
    }

    pub fn values(&self) -> &ValueMap {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ValueMap {
        &mut self.values
    }

    pub fn into_values(self) -> ValueMap {
        self.values
    }

    pub fn last_change(&self) -> i64 {
        self.last_change
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn mark_existing(&mut self) {
        self.is_new = false;
    }

    /// Event count, if the counter is present
    pub fn number_events(&self) -> Option<f64> {
        self.values.get(NUMBER_EVENTS).and_then(Value::as_number)
    }

    /// The `*expires*` setting, if it is a positive number
    pub fn expires_after(&self) -> Option<i64> {
        self.values
            .get(EXPIRES)
            .and_then(Value::as_number)
            .filter(|expires| *expires > 0.0)
            .map(|expires| expires as i64)
    }
}

/// Constant and variable state handed to one analysis run
#[derive(Debug, Clone, PartialEq)]
pub struct StatePair {
    pub constants: AnalysisState,
    pub variables: AnalysisState,
}

/// Persisted shape of [`AllAnalysesStates`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateIndex {
    pub constants: HashMap<AnalysisId, AnalysisState>,
    pub variables: HashMap<AnalysisId, HashMap<EntityId, AnalysisState>>,
}

impl StateIndex {
    pub fn entity_count(&self, analysis_id: &AnalysisId) -> usize {
        self.variables.get(analysis_id).map_or(0, HashMap::len)
    }
}

/// Counts from one expiry pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed_analyses: usize,
    pub removed_entities: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.removed_analyses + self.removed_entities == 0
    }
}

/// Process-wide index of analysis state backed by an object store
pub struct AllAnalysesStates {
    index: StateIndex,
    store: Arc<dyn ObjectStore>,
    closed: bool,
}

impl AllAnalysesStates {
    /// Load the index from `store`, starting empty if it holds nothing
    pub fn open(store: Arc<dyn ObjectStore>) -> Result<Self> {
        let index = store.load()?.unwrap_or_default();
        info!(
            analyses = index.constants.len(),
            "Loaded analysis state index"
        );
        Ok(Self {
            index,
            store,
            closed: false,
        })
    }

    pub fn index(&self) -> &StateIndex {
        &self.index
    }

    pub fn constants(&self, analysis_id: &AnalysisId) -> Option<&AnalysisState> {
        self.index.constants.get(analysis_id)
    }

    pub fn variables(&self, analysis_id: &AnalysisId, entity_id: &EntityId) -> Option<&AnalysisState> {
        self.index
            .variables
            .get(analysis_id)
            .and_then(|entities| entities.get(entity_id))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(StateError::ShuttingDown);
        }
        Ok(())
    }

    /// Retrieve or create the state pair for one analysis run
    ///
    /// A script modified after the constant state's last change clears the
    /// constant state and the entity's variable state in place. Otherwise an
    /// existing variable state counts one more event.
    ///
    /// The count is taken here, in the index, so an event whose evaluation
    /// later fails stays counted. The file backend only counts events of runs
    /// it saves.
    pub fn make_analysis_state(
        &mut self,
        analysis_id: &AnalysisId,
        entity_id: &EntityId,
        script_modified: i64,
        now: i64,
    ) -> Result<StatePair> {
        self.ensure_open()?;

        let Some(constants) = self.index.constants.get_mut(analysis_id) else {
            debug!(analysis = %analysis_id, entity = %entity_id, "Creating analysis state");
            return Ok(StatePair {
                constants: AnalysisState::new(Mutability::Constant, now),
                variables: AnalysisState::new(Mutability::Variable, now),
            });
        };

        let script_changed = script_modified > constants.last_change();
        if script_changed {
            info!(
                analysis = %analysis_id,
                "Analysis script changed, reinitializing state"
            );
            constants.reinitialize(Mutability::Constant, now);
        }
        let constants = constants.clone();

        let existing = self
            .index
            .variables
            .get_mut(analysis_id)
            .and_then(|entities| entities.get_mut(entity_id));
        let variables = match existing {
            Some(variables) => {
                if script_changed {
                    variables.reinitialize(Mutability::Variable, now);
                } else {
                    variables.record_event(now);
                }
                variables.clone()
            }
            None => AnalysisState::new(Mutability::Variable, now),
        };

        Ok(StatePair {
            constants,
            variables,
        })
    }

    /// Write a state pair back into the index and persist it
    ///
    /// Returns the store targets written: the constant index or the single
    /// constant state, then the variable index, the analysis' entity index,
    /// or the single variable state.
    pub fn save_analysis_state(
        &mut self,
        analysis_id: &AnalysisId,
        entity_id: &EntityId,
        pair: StatePair,
    ) -> Result<Vec<StoreTarget>> {
        self.ensure_open()?;
        let StatePair {
            mut constants,
            mut variables,
        } = pair;
        let mut targets = Vec::with_capacity(2);

        if constants.is_new() || !self.index.constants.contains_key(analysis_id) {
            constants.mark_existing();
            targets.push(StoreTarget::ConstantIndex);
        } else {
            targets.push(StoreTarget::Constant(analysis_id.clone()));
        }
        self.index.constants.insert(analysis_id.clone(), constants);

        let known_entity = self.variables(analysis_id, entity_id).is_some();
        variables.mark_existing();
        match self.index.variables.get_mut(analysis_id) {
            Some(entities) => {
                entities.insert(entity_id.clone(), variables);
                targets.push(if known_entity {
                    StoreTarget::Variable(analysis_id.clone(), entity_id.clone())
                } else {
                    StoreTarget::EntityIndex(analysis_id.clone())
                });
            }
            None => {
                let mut entities = HashMap::new();
                entities.insert(entity_id.clone(), variables);
                self.index.variables.insert(analysis_id.clone(), entities);
                targets.push(StoreTarget::VariableIndex);
            }
        }

        for target in &targets {
            self.store.store(&self.index, target)?;
        }
        debug!(analysis = %analysis_id, entity = %entity_id, ?targets, "Saved analysis state");
        Ok(targets)
    }

    /// Remove entity state idle for longer than its analysis' `*expires*`
    ///
    /// An analysis left without entities is removed as well. The index is
    /// persisted only if something was removed.
    pub fn purge_expired(&mut self, now: i64) -> Result<SweepReport> {
        self.ensure_open()?;
        let mut report = SweepReport::default();

        let expiring: Vec<(AnalysisId, i64)> = self
            .index
            .constants
            .iter()
            .filter_map(|(id, state)| state.expires_after().map(|expires| (id.clone(), expires)))
            .collect();

        for (analysis_id, expires) in expiring {
            let cutoff = now.saturating_sub(expires);
            let remaining = match self.index.variables.get_mut(&analysis_id) {
                Some(entities) => {
                    let before = entities.len();
                    entities.retain(|_, state| state.last_change() >= cutoff);
                    report.removed_entities += before - entities.len();
                    entities.len()
                }
                None => 0,
            };
            if remaining == 0 {
                self.index.variables.remove(&analysis_id);
                self.index.constants.remove(&analysis_id);
                report.removed_analyses += 1;
            }
        }

        if !report.is_empty() {
            self.store.store(&self.index, &StoreTarget::Root)?;
        }
        info!(
            removed_analyses = report.removed_analyses,
            removed_entities = report.removed_entities,
            "Expired analysis state purged"
        );
        Ok(report)
    }

    /// Flush the store and refuse further mutation
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.store.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn ids() -> (AnalysisId, EntityId) {
        (AnalysisId::new("A"), EntityId::new("E1"))
    }

    fn open() -> (AllAnalysesStates, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let states = AllAnalysesStates::open(store.clone()).unwrap();
        (states, store)
    }

    #[test]
    fn test_fresh_variable_state_is_seeded() {
        let state = AnalysisState::new(Mutability::Variable, 42);
        assert_eq!(state.number_events(), Some(1.0));
        assert_eq!(state.values().get(NOW), Some(&Value::number(42.0)));
        assert!(state.is_new());

        let constants = AnalysisState::new(Mutability::Constant, 42);
        assert!(constants.values().is_empty());
    }

    #[test]
    fn test_first_run_creates_new_pair() {
        let (mut states, store) = open();
        let (a, e) = ids();
        let pair = states.make_analysis_state(&a, &e, 0, 100).unwrap();
        assert!(pair.constants.is_new());
        assert!(pair.variables.is_new());

        let targets = states.save_analysis_state(&a, &e, pair).unwrap();
        assert_eq!(
            targets,
            vec![StoreTarget::ConstantIndex, StoreTarget::VariableIndex]
        );
        assert_eq!(store.writes(), targets);
        assert!(!states.constants(&a).unwrap().is_new());
    }

    #[test]
    fn test_write_shapes_for_existing_state() {
        let (mut states, _) = open();
        let (a, e) = ids();
        let pair = states.make_analysis_state(&a, &e, 0, 100).unwrap();
        states.save_analysis_state(&a, &e, pair).unwrap();

        let other = EntityId::new("E2");
        let pair = states.make_analysis_state(&a, &other, 0, 200).unwrap();
        assert!(!pair.constants.is_new());
        assert!(pair.variables.is_new());
        let targets = states.save_analysis_state(&a, &other, pair).unwrap();
        assert_eq!(
            targets,
            vec![
                StoreTarget::Constant(a.clone()),
                StoreTarget::EntityIndex(a.clone())
            ]
        );

        let pair = states.make_analysis_state(&a, &e, 0, 300).unwrap();
        let targets = states.save_analysis_state(&a, &e, pair).unwrap();
        assert_eq!(
            targets,
            vec![
                StoreTarget::Constant(a.clone()),
                StoreTarget::Variable(a.clone(), e.clone())
            ]
        );
    }

    #[test]
    fn test_event_counting() {
        let (mut states, _) = open();
        let (a, e) = ids();
        let pair = states.make_analysis_state(&a, &e, 0, 100).unwrap();
        states.save_analysis_state(&a, &e, pair).unwrap();

        for (call, now) in [(2.0, 200), (3.0, 300), (4.0, 400)] {
            let pair = states.make_analysis_state(&a, &e, 0, now).unwrap();
            assert_eq!(pair.variables.number_events(), Some(call));
            assert_eq!(
                pair.variables.values().get(NOW),
                Some(&Value::number(now as f64))
            );
        }
    }

    #[test]
    fn test_script_change_reinitializes_in_place() {
        let (mut states, _) = open();
        let (a, e) = ids();
        let mut pair = states.make_analysis_state(&a, &e, 0, 100).unwrap();
        pair.constants
            .values_mut()
            .insert("threshold", Value::number(3.0));
        pair.variables.values_mut().insert("seen", Value::boolean(true));
        states.save_analysis_state(&a, &e, pair).unwrap();
        states.make_analysis_state(&a, &e, 0, 150).unwrap();

        let pair = states.make_analysis_state(&a, &e, 500, 600).unwrap();
        assert!(!pair.constants.is_new());
        assert!(pair.constants.values().is_empty());
        assert_eq!(pair.constants.last_change(), 600);
        assert!(!pair.variables.is_new());
        assert_eq!(pair.variables.number_events(), Some(1.0));
        assert!(pair.variables.values().get("seen").is_none());
    }

    #[test]
    fn test_purge_removes_idle_entities_then_analysis() {
        let (mut states, store) = open();
        let (a, e) = ids();
        let mut pair = states.make_analysis_state(&a, &e, 0, 1_000).unwrap();
        pair.constants
            .values_mut()
            .insert(EXPIRES, Value::number(1_000.0));
        states.save_analysis_state(&a, &e, pair).unwrap();

        let report = states.purge_expired(1_500).unwrap();
        assert!(report.is_empty());

        let report = states.purge_expired(3_000).unwrap();
        assert_eq!(
            report,
            SweepReport {
                removed_analyses: 1,
                removed_entities: 1
            }
        );
        assert!(states.constants(&a).is_none());
        assert_eq!(store.writes().last(), Some(&StoreTarget::Root));
    }

    #[test]
    fn test_purge_keeps_analysis_with_live_entities() {
        let (mut states, _) = open();
        let a = AnalysisId::new("A");
        let (old, fresh) = (EntityId::new("old"), EntityId::new("fresh"));

        let mut pair = states.make_analysis_state(&a, &old, 0, 0).unwrap();
        pair.constants
            .values_mut()
            .insert(EXPIRES, Value::number(1_000.0));
        states.save_analysis_state(&a, &old, pair).unwrap();
        let pair = states.make_analysis_state(&a, &fresh, 0, 2_500).unwrap();
        states.save_analysis_state(&a, &fresh, pair).unwrap();

        let report = states.purge_expired(3_000).unwrap();
        assert_eq!(report.removed_entities, 1);
        assert_eq!(report.removed_analyses, 0);
        assert!(states.variables(&a, &fresh).is_some());
        assert!(states.variables(&a, &old).is_none());
    }

    #[test]
    fn test_closed_index_rejects_mutation() {
        let (mut states, _) = open();
        let (a, e) = ids();
        states.close().unwrap();
        assert!(matches!(
            states.make_analysis_state(&a, &e, 0, 0),
            Err(StateError::ShuttingDown)
        ));
        assert!(states.close().is_ok());
    }

    #[test]
    fn test_bump_event_counter_requires_counter() {
        let mut values = ValueMap::new();
        assert!(!bump_event_counter(&mut values, 5));
        values.insert(NUMBER_EVENTS, Value::number(2.0));
        assert!(bump_event_counter(&mut values, 5));
        assert_eq!(values.get(NUMBER_EVENTS), Some(&Value::number(3.0)));
        assert_eq!(values.get(NOW), Some(&Value::number(5.0)));
    }
}
