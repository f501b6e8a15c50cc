//! Single-slot analysis cache
//!
//! With caching enabled, consecutive events for the same entity and
//! analysis reuse the instantiated script and the state of the previous run
//! instead of reading them back from disk.

use crate::error::{AnalysisError, Result};
use capflow_core::state::bump_event_counter;
use capflow_core::StatePair;
use capflow_types::{AnalysisId, EntityId};
use parking_lot::Mutex;

/// The state left behind by the last cached run
#[derive(Debug, Clone)]
pub struct CachedAnalysis {
    pub analysis_id: AnalysisId,
    pub entity_id: EntityId,
    pub script: String,
    pub pair: StatePair,
}

#[derive(Debug, Default)]
pub struct AnalysisCache {
    slot: Mutex<Option<CachedAnalysis>>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Empty the slot, returning whether it held anything
    pub fn clear(&self) -> bool {
        self.slot.lock().take().is_some()
    }

    /// A copy of the cached script and state pair, with one more event counted
    ///
    /// The slot itself is unchanged until the run's state is stored back, so
    /// a failed evaluation does not count its event. Returns `None` when the
    /// slot is empty. A populated slot for another entity or analysis is an
    /// error.
    pub fn checkout(
        &self,
        analysis_id: &AnalysisId,
        entity_id: &EntityId,
        now: i64,
    ) -> Result<Option<(String, StatePair)>> {
        let slot = self.slot.lock();
        let Some(cached) = slot.as_ref() else {
            return Ok(None);
        };
        if &cached.analysis_id != analysis_id || &cached.entity_id != entity_id {
            return Err(AnalysisError::StaleCacheMismatch {
                cached_entity: cached.entity_id.clone(),
                cached_analysis: cached.analysis_id.clone(),
                entity: entity_id.clone(),
                analysis: analysis_id.clone(),
            });
        }
        let mut pair = cached.pair.clone();
        if !bump_event_counter(pair.variables.values_mut(), now) {
            return Err(AnalysisError::MissingEventCounter);
        }
        Ok(Some((cached.script.clone(), pair)))
    }

    pub fn store(&self, cached: CachedAnalysis) {
        *self.slot.lock() = Some(cached);
    }

    pub fn take(&self) -> Option<CachedAnalysis> {
        self.slot.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capflow_core::{AnalysisState, NUMBER_EVENTS};
    use capflow_types::Mutability;

    fn cached(analysis: &str, entity: &str) -> CachedAnalysis {
        CachedAnalysis {
            analysis_id: AnalysisId::new(analysis),
            entity_id: EntityId::new(entity),
            script: "emit 1".to_string(),
            pair: StatePair {
                constants: AnalysisState::new(Mutability::Constant, 0),
                variables: AnalysisState::new(Mutability::Variable, 0),
            },
        }
    }

    #[test]
    fn test_hit_counts_event() {
        let cache = AnalysisCache::new();
        let (a, e) = (AnalysisId::new("A"), EntityId::new("E1"));
        assert!(cache.checkout(&a, &e, 10).unwrap().is_none());

        cache.store(cached("A", "E1"));
        let (script, pair) = cache.checkout(&a, &e, 10).unwrap().unwrap();
        assert_eq!(script, "emit 1");
        assert_eq!(pair.variables.number_events(), Some(2.0));
        let (script, pair) = cache.checkout(&a, &e, 20).unwrap().unwrap();
        assert_eq!(pair.variables.number_events(), Some(2.0));

        cache.store(CachedAnalysis {
            analysis_id: a.clone(),
            entity_id: e.clone(),
            script,
            pair,
        });
        let (_, pair) = cache.checkout(&a, &e, 30).unwrap().unwrap();
        assert_eq!(pair.variables.number_events(), Some(3.0));
    }

    #[test]
    fn test_checkout_leaves_slot_unchanged() {
        let cache = AnalysisCache::new();
        let (a, e) = (AnalysisId::new("A"), EntityId::new("E1"));
        cache.store(cached("A", "E1"));

        let (_, mut pair) = cache.checkout(&a, &e, 10).unwrap().unwrap();
        pair.variables.values_mut().remove(NUMBER_EVENTS);

        let kept = cache.take().unwrap();
        assert_eq!(kept.pair.variables.number_events(), Some(1.0));
    }

    #[test]
    fn test_mismatch_is_error() {
        let cache = AnalysisCache::new();
        cache.store(cached("A", "E1"));
        let err = cache
            .checkout(&AnalysisId::new("A"), &EntityId::new("E2"), 0)
            .unwrap_err();
        assert!(matches!(err, AnalysisError::StaleCacheMismatch { .. }));
        assert!(err.to_string().contains("cached entity ID = \"E1\""));
        assert!(!cache.is_empty());
    }

    #[test]
    fn test_missing_counter() {
        let cache = AnalysisCache::new();
        let mut entry = cached("A", "E1");
        entry.pair.variables.values_mut().remove(NUMBER_EVENTS);
        cache.store(entry);
        assert!(matches!(
            cache.checkout(&AnalysisId::new("A"), &EntityId::new("E1"), 0),
            Err(AnalysisError::MissingEventCounter)
        ));
        assert!(cache.clear());
        assert!(!cache.clear());
    }
}
