//! Durable object stores for the state index
//!
//! The delegating backend keeps [`StateIndex`] in memory and asks an
//! [`ObjectStore`] to persist the part of it a change touched.

use crate::error::{Result, StateError};
use crate::state::{AnalysisState, StateIndex};
use capflow_types::{AnalysisId, EntityId};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Part of the index a write covers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreTarget {
    /// The whole index
    Root,
    /// The analysis id → constant state mapping
    ConstantIndex,
    /// One constant state
    Constant(AnalysisId),
    /// The analysis id → entity mapping
    VariableIndex,
    /// The entity id → variable state mapping of one analysis
    EntityIndex(AnalysisId),
    /// One variable state
    Variable(AnalysisId, EntityId),
}

/// Persistence for the state index
pub trait ObjectStore: Send + Sync {
    /// The stored index, or `None` if nothing has been stored yet
    fn load(&self) -> Result<Option<StateIndex>>;

    /// Persist the part of `index` named by `target`
    fn store(&self, index: &StateIndex, target: &StoreTarget) -> Result<()>;

    fn flush(&self) -> Result<()>;
}

/// Non-durable store that records every write
#[derive(Debug, Default)]
pub struct MemoryStore {
    latest: Mutex<Option<StateIndex>>,
    writes: Mutex<Vec<StoreTarget>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets written so far, oldest first
    pub fn writes(&self) -> Vec<StoreTarget> {
        self.writes.lock().clone()
    }

    pub fn take_writes(&self) -> Vec<StoreTarget> {
        std::mem::take(&mut *self.writes.lock())
    }
}

impl ObjectStore for MemoryStore {
    fn load(&self) -> Result<Option<StateIndex>> {
        Ok(self.latest.lock().clone())
    }

    fn store(&self, index: &StateIndex, target: &StoreTarget) -> Result<()> {
        *self.latest.lock() = Some(index.clone());
        self.writes.lock().push(target.clone());
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

const CONSTANTS_DIR: &str = "constants";
const VARIABLES_DIR: &str = "variables";
const EXTENSION: &str = "json";

/// JSON snapshot files under one directory, one file per state object
///
/// `constants/<analysisId>.json` holds a constant state and
/// `variables/<analysisId>/<entityId>.json` a variable state. Writing a
/// single state touches one file; only the index targets add or remove
/// files.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn constants_dir(&self) -> PathBuf {
        self.dir.join(CONSTANTS_DIR)
    }

    fn constant_path(&self, analysis_id: &AnalysisId) -> PathBuf {
        self.constants_dir()
            .join(format!("{}.{}", analysis_id, EXTENSION))
    }

    fn variables_dir(&self) -> PathBuf {
        self.dir.join(VARIABLES_DIR)
    }

    fn entities_dir(&self, analysis_id: &AnalysisId) -> PathBuf {
        self.variables_dir().join(analysis_id.as_str())
    }

    fn variable_path(&self, analysis_id: &AnalysisId, entity_id: &EntityId) -> PathBuf {
        self.entities_dir(analysis_id)
            .join(format!("{}.{}", entity_id, EXTENSION))
    }

    fn write_constant(&self, index: &StateIndex, analysis_id: &AnalysisId) -> Result<()> {
        let path = self.constant_path(analysis_id);
        match index.constants.get(analysis_id) {
            Some(state) => write_json(&path, state),
            None => remove_if_present(&path),
        }
    }

    fn write_variable(
        &self,
        index: &StateIndex,
        analysis_id: &AnalysisId,
        entity_id: &EntityId,
    ) -> Result<()> {
        let path = self.variable_path(analysis_id, entity_id);
        match index
            .variables
            .get(analysis_id)
            .and_then(|entities| entities.get(entity_id))
        {
            Some(state) => write_json(&path, state),
            None => remove_if_present(&path),
        }
    }

    /// Write every constant state and drop files of removed analyses
    fn write_constant_index(&self, index: &StateIndex) -> Result<()> {
        let dir = self.constants_dir();
        fs::create_dir_all(&dir).map_err(|e| StateError::io(&dir, e))?;
        for analysis_id in index.constants.keys() {
            self.write_constant(index, analysis_id)?;
        }
        for (analysis_id, path) in json_files(&dir)? {
            if !index.constants.contains_key(&AnalysisId::new(analysis_id)) {
                remove_if_present(&path)?;
            }
        }
        Ok(())
    }

    /// Bring the entity files of one analysis in line with the index
    ///
    /// Files of entities missing from disk are written and files of entities
    /// no longer indexed are removed. With `rewrite` every indexed entity is
    /// written.
    fn sync_entities(
        &self,
        index: &StateIndex,
        analysis_id: &AnalysisId,
        rewrite: bool,
    ) -> Result<()> {
        let dir = self.entities_dir(analysis_id);
        let Some(entities) = index.variables.get(analysis_id) else {
            debug!(analysis = %analysis_id, "Removing variable snapshots of dropped analysis");
            return remove_dir_if_present(&dir);
        };
        let stored: HashMap<EntityId, PathBuf> = json_files(&dir)?
            .into_iter()
            .map(|(entity_id, path)| (EntityId::new(entity_id), path))
            .collect();
        for entity_id in entities.keys() {
            if rewrite || !stored.contains_key(entity_id) {
                self.write_variable(index, analysis_id, entity_id)?;
            }
        }
        for (entity_id, path) in &stored {
            if !entities.contains_key(entity_id) {
                remove_if_present(path)?;
            }
        }
        Ok(())
    }

    /// Sync every analysis' entity files and drop directories of removed analyses
    fn sync_all_entities(&self, index: &StateIndex, rewrite: bool) -> Result<()> {
        for analysis_id in index.variables.keys() {
            self.sync_entities(index, analysis_id, rewrite)?;
        }
        for analysis_id in stored_dirs(&self.variables_dir())? {
            let analysis_id = AnalysisId::new(analysis_id);
            if !index.variables.contains_key(&analysis_id) {
                self.sync_entities(index, &analysis_id, rewrite)?;
            }
        }
        Ok(())
    }
}

impl ObjectStore for SnapshotStore {
    fn load(&self) -> Result<Option<StateIndex>> {
        let constants_dir = self.constants_dir();
        if !constants_dir.is_dir() {
            return Ok(None);
        }
        let mut index = StateIndex::default();
        for (analysis_id, path) in json_files(&constants_dir)? {
            let state: AnalysisState = read_json(&path)?;
            index.constants.insert(AnalysisId::new(analysis_id), state);
        }
        for analysis_id in stored_dirs(&self.variables_dir())? {
            let analysis_id = AnalysisId::new(analysis_id);
            let mut entities = HashMap::new();
            for (entity_id, path) in json_files(&self.entities_dir(&analysis_id))? {
                let state: AnalysisState = read_json(&path)?;
                entities.insert(EntityId::new(entity_id), state);
            }
            if !entities.is_empty() {
                index.variables.insert(analysis_id, entities);
            }
        }
        info!(dir = %self.dir.display(), "Loaded state snapshot");
        Ok(Some(index))
    }

    fn store(&self, index: &StateIndex, target: &StoreTarget) -> Result<()> {
        let _guard = self.write_lock.lock();
        match target {
            StoreTarget::Root => {
                self.write_constant_index(index)?;
                self.sync_all_entities(index, true)
            }
            StoreTarget::ConstantIndex => self.write_constant_index(index),
            StoreTarget::Constant(analysis_id) => self.write_constant(index, analysis_id),
            StoreTarget::VariableIndex => self.sync_all_entities(index, false),
            StoreTarget::EntityIndex(analysis_id) => self.sync_entities(index, analysis_id, false),
            StoreTarget::Variable(analysis_id, entity_id) => {
                self.write_variable(index, analysis_id, entity_id)
            }
        }
    }

    fn flush(&self) -> Result<()> {
        // Every store call is written through
        Ok(())
    }
}

/// `(file stem, path)` of the JSON files directly inside `dir`
fn json_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in read_dir_entries(dir)? {
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION)
        {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            files.push((stem.to_string(), path.to_path_buf()));
        }
    }
    Ok(files)
}

/// Names of the directories directly inside `dir`
fn stored_dirs(dir: &Path) -> Result<Vec<String>> {
    Ok(read_dir_entries(dir)?
        .into_iter()
        .filter(|entry| entry.file_type().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect())
}

fn read_dir_entries(dir: &Path) -> Result<Vec<walkdir::DirEntry>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .map(|entry| entry.map_err(|e| StateError::Persistence(e.to_string())))
        .collect()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| StateError::io(path, e))?;
    Ok(serde_json::from_str(&text)?)
}

/// Write via a temporary file so readers never see a partial snapshot
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
    }
    let text = serde_json::to_string(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text).map_err(|e| StateError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StateError::io(path, e))
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StateError::io(path, e)),
    }
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StateError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AllAnalysesStates;
    use crate::value::{NumericOp, Value};
    use capflow_types::Mutability;
    use std::sync::Arc;

    fn sample_index() -> StateIndex {
        let a = AnalysisId::new("fraud");
        let mut constants = AnalysisState::new(Mutability::Constant, 10);
        constants
            .values_mut()
            .insert("limit", Value::number(5.0));
        let mut index = StateIndex::default();
        index.constants.insert(a.clone(), constants);
        let mut entities = HashMap::new();
        entities.insert(
            EntityId::new("u1"),
            AnalysisState::new(Mutability::Variable, 10),
        );
        index.variables.insert(a, entities);
        index
    }

    #[test]
    fn test_memory_store_records_targets() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());
        store
            .store(&sample_index(), &StoreTarget::ConstantIndex)
            .unwrap();
        assert_eq!(store.take_writes(), vec![StoreTarget::ConstantIndex]);
        assert!(store.writes().is_empty());
        assert!(store.load().unwrap().is_some());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store.load().unwrap().is_none());

        let index = sample_index();
        store.store(&index, &StoreTarget::Root).unwrap();
        assert!(dir.path().join("constants").join("fraud.json").exists());
        assert!(dir
            .path()
            .join("variables")
            .join("fraud")
            .join("u1.json")
            .exists());

        let loaded = store.load().unwrap().unwrap();
        let a = AnalysisId::new("fraud");
        assert_eq!(
            loaded.constants[&a].values().get("limit"),
            Some(&Value::number(5.0))
        );
        assert_eq!(loaded.entity_count(&a), 1);
        assert!(!loaded.constants[&a].is_new());
    }

    #[test]
    fn test_root_write_removes_stale_analyses() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let mut index = sample_index();
        store.store(&index, &StoreTarget::Root).unwrap();

        index.variables.clear();
        index.constants.clear();
        store.store(&index, &StoreTarget::Root).unwrap();
        assert!(!dir.path().join("variables").join("fraud").exists());
        assert!(!dir.path().join("constants").join("fraud.json").exists());
        assert!(store.load().unwrap().unwrap().constants.is_empty());
    }

    #[test]
    fn test_single_state_writes_leave_siblings_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let (a, other) = (AnalysisId::new("fraud"), AnalysisId::new("churn"));
        let (u1, u2) = (EntityId::new("u1"), EntityId::new("u2"));

        let mut index = sample_index();
        index
            .constants
            .insert(other.clone(), AnalysisState::new(Mutability::Constant, 10));
        index.variables.get_mut(&a).unwrap().insert(
            u2.clone(),
            AnalysisState::new(Mutability::Variable, 10),
        );
        store.store(&index, &StoreTarget::Root).unwrap();

        let sibling = dir.path().join("variables").join("fraud").join("u2.json");
        let other_constant = dir.path().join("constants").join("churn.json");
        fs::write(&sibling, "untouched").unwrap();
        fs::write(&other_constant, "untouched").unwrap();

        let entities = index.variables.get_mut(&a).unwrap();
        entities
            .get_mut(&u1)
            .unwrap()
            .values_mut()
            .insert("seen", Value::boolean(true));
        store
            .store(&index, &StoreTarget::Variable(a.clone(), u1.clone()))
            .unwrap();
        store
            .store(&index, &StoreTarget::Constant(a.clone()))
            .unwrap();

        assert_eq!(fs::read_to_string(&sibling).unwrap(), "untouched");
        assert_eq!(fs::read_to_string(&other_constant).unwrap(), "untouched");
        let written: AnalysisState =
            read_json(&dir.path().join("variables").join("fraud").join("u1.json")).unwrap();
        assert_eq!(written.values().get("seen"), Some(&Value::boolean(true)));
    }

    #[test]
    fn test_entity_index_adds_and_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let a = AnalysisId::new("fraud");
        let mut index = sample_index();
        store.store(&index, &StoreTarget::Root).unwrap();

        let entities = index.variables.get_mut(&a).unwrap();
        entities.remove(&EntityId::new("u1"));
        entities.insert(
            EntityId::new("u3"),
            AnalysisState::new(Mutability::Variable, 20),
        );
        store
            .store(&index, &StoreTarget::EntityIndex(a.clone()))
            .unwrap();

        let entities_dir = dir.path().join("variables").join("fraud");
        assert!(!entities_dir.join("u1.json").exists());
        assert!(entities_dir.join("u3.json").exists());
    }

    #[test]
    fn test_non_finite_numbers_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(SnapshotStore::new(dir.path()));
        let (a, e) = (AnalysisId::new("fraud"), EntityId::new("u1"));

        let mut states = AllAnalysesStates::open(store.clone()).unwrap();
        let mut pair = states.make_analysis_state(&a, &e, 0, 100).unwrap();
        let mut ratio = Value::number(0.0);
        ratio.modify_number(NumericOp::Divide, 0.0).unwrap();
        let mut rate = Value::number(1.0);
        rate.modify_number(NumericOp::Divide, 0.0).unwrap();
        pair.variables.values_mut().insert("ratio", ratio);
        pair.variables.values_mut().insert("rate", rate);
        states.save_analysis_state(&a, &e, pair).unwrap();

        let reopened = AllAnalysesStates::open(store).unwrap();
        let variables = reopened.variables(&a, &e).unwrap().values();
        assert!(variables.get("ratio").unwrap().as_number().unwrap().is_nan());
        assert_eq!(variables.get("rate"), Some(&Value::number(f64::INFINITY)));
    }
}
