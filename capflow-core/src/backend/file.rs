use super::{modified_millis, InspectedState, Retrieval, StateBackend, StoredAnalysis};
use crate::codec::{DocumentDecoder, DocumentEncoder};
use crate::collection::ValueMap;
use crate::config::BackendKind;
use crate::error::{Result, StateError};
use crate::state::{AnalysisState, StatePair, SweepReport, EXPIRES, NOW};
use crate::value::Value;
use capflow_types::{AnalysisId, EntityId, Mutability};
use glob_match::glob_match;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const ANALYSIS_SUFFIX: &str = "-analysisState.json";
const ENTITY_SUFFIX: &str = "-entityState.json";

/// Backend storing one JSON document per analysis and per entity
///
/// Documents live at `<dir>/<analysisId>-analysisState.json` and
/// `<dir>/<analysisId>-<entityId>-entityState.json`. A document older than
/// the analysis script is treated as absent.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn analysis_path(&self, analysis_id: &AnalysisId) -> PathBuf {
        self.dir.join(format!("{}{}", analysis_id, ANALYSIS_SUFFIX))
    }

    pub fn entity_path(&self, analysis_id: &AnalysisId, entity_id: &EntityId) -> PathBuf {
        self.dir
            .join(format!("{}-{}{}", analysis_id, entity_id, ENTITY_SUFFIX))
    }

    /// Decode the document at `path`
    ///
    /// `reinitialize_if_older_than` of `None` means reset: the document is
    /// ignored. A missing, blank, `null` or stale document yields `None`.
    fn read_document(
        &self,
        path: &Path,
        decoder: &DocumentDecoder,
        reinitialize_if_older_than: Option<i64>,
    ) -> Result<Option<(ValueMap, i64)>> {
        let Some(threshold) = reinitialize_if_older_than else {
            info!(path = %path.display(), "Reinitializing state, reset requested");
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let modified = modified_millis(path)?;
        if modified < threshold {
            info!(
                path = %path.display(),
                "Reinitializing state written before the analysis was modified"
            );
            return Ok(None);
        }
        let text = fs::read_to_string(path).map_err(|e| StateError::io(path, e))?;
        if text.trim().is_empty() || text.trim() == "null" {
            return Ok(None);
        }
        let values = decoder.decode_str(&text).map_err(|reason| {
            warn!(path = %path.display(), %reason, "Corrupt state document");
            StateError::CorruptStateDocument {
                path: path.to_path_buf(),
                reason,
            }
        })?;
        Ok(Some((values, modified)))
    }

    fn write_document(&self, path: &Path, contents: String) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| StateError::io(&self.dir, e))?;
        fs::write(path, contents).map_err(|e| StateError::io(path, e))
    }

    fn file_names(&self) -> Result<Vec<String>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| StateError::Persistence(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete entity documents of one analysis last written before `cutoff`
    ///
    /// Returns the number deleted and whether any document survived.
    fn purge_entities(
        &self,
        analysis_id: &str,
        names: &[String],
        analyses: &[&str],
        cutoff: i64,
    ) -> (usize, bool) {
        let pattern = format!("{}-*{}", analysis_id, ENTITY_SUFFIX);
        let mut removed = 0;
        let mut survivors = false;
        let owned = names.iter().filter(|name| {
            glob_match(&pattern, name)
                && owning_analysis(name, analyses).map(|(owner, _)| owner) == Some(analysis_id)
        });
        for name in owned {
            let path = self.dir.join(name);
            match modified_millis(&path) {
                Ok(modified) if modified < cutoff => match fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(file = %name, "Deleted expired entity state");
                        removed += 1;
                    }
                    Err(e) => {
                        warn!(file = %name, error = %e, "Unable to delete expired entity state");
                        survivors = true;
                    }
                },
                Ok(_) => survivors = true,
                Err(e) => {
                    warn!(file = %name, error = %e, "Unable to read entity state file");
                    survivors = true;
                }
            }
        }
        (removed, survivors)
    }
}

/// Ids of the analyses with a document in `names`, longest first
fn analysis_ids(names: &[String]) -> Vec<&str> {
    let mut ids: Vec<&str> = names
        .iter()
        .filter_map(|name| name.strip_suffix(ANALYSIS_SUFFIX))
        .collect();
    ids.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    ids
}

/// The analysis and entity an entity document belongs to
///
/// File names do not delimit analysis ids, so `a-b-x-entityState.json`
/// belongs to the longest analysis id with a document that prefixes it:
/// `a-b` when both `a` and `a-b` exist.
fn owning_analysis<'a, 'n>(name: &'n str, analyses: &[&'a str]) -> Option<(&'a str, &'n str)> {
    let stem = name.strip_suffix(ENTITY_SUFFIX)?;
    analyses.iter().copied().find_map(|analysis_id| {
        let entity_id = stem.strip_prefix(analysis_id)?.strip_prefix('-')?;
        (!entity_id.is_empty()).then_some((analysis_id, entity_id))
    })
}

fn expires_setting(text: &str) -> Option<i64> {
    let document: serde_json::Value = serde_json::from_str(text).ok()?;
    let expires = document.get(EXPIRES)?.as_f64()? as i64;
    (expires > 0).then_some(expires)
}

impl StateBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    fn load(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| StateError::io(&self.dir, e))
    }

    fn retrieve(&self, request: &Retrieval<'_>) -> Result<StatePair> {
        let threshold = if request.force_reset {
            None
        } else {
            Some(modified_millis(request.script_path)?)
        };
        let now = request.now;

        let constants_path = self.analysis_path(request.analysis_id);
        let decoder = DocumentDecoder::new(Mutability::Constant, now);
        let constants = match self.read_document(&constants_path, &decoder, threshold)? {
            Some((values, modified)) => AnalysisState::from_values(values, modified),
            None => AnalysisState::new(Mutability::Constant, now),
        };

        // Entity state never outlives the analysis state it was built against
        let threshold = if constants.is_new() { None } else { threshold };
        let variables_path = self.entity_path(request.analysis_id, request.entity_id);
        let decoder = DocumentDecoder::new(Mutability::Variable, now);
        let variables = match self.read_document(&variables_path, &decoder, threshold)? {
            Some((mut values, _)) => {
                values.insert(NOW, Value::number(now as f64));
                AnalysisState::from_values(values, now)
            }
            None => AnalysisState::new(Mutability::Variable, now),
        };

        Ok(StatePair {
            constants,
            variables,
        })
    }

    fn save(&self, analysis_id: &AnalysisId, entity_id: &EntityId, pair: StatePair) -> Result<()> {
        let encoder = DocumentEncoder::new().decorated(true);
        let constants = encoder
            .scoped(Mutability::Constant)
            .encode_string(pair.constants.values());
        let variables = encoder
            .scoped(Mutability::Variable)
            .encode_string(pair.variables.values());
        self.write_document(&self.analysis_path(analysis_id), constants)?;
        self.write_document(&self.entity_path(analysis_id, entity_id), variables)?;
        debug!(analysis = %analysis_id, entity = %entity_id, "Saved state documents");
        Ok(())
    }

    fn sweep(&self, now: i64) -> Result<SweepReport> {
        let names = self.file_names()?;
        let analyses = analysis_ids(&names);
        let mut report = SweepReport::default();

        for name in names.iter().filter(|name| name.ends_with(ANALYSIS_SUFFIX)) {
            let path = self.dir.join(name);
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    warn!(file = %name, error = %e, "Unable to read analysis state file");
                    continue;
                }
            };
            let Some(expires) = expires_setting(&text) else {
                continue;
            };
            let cutoff = now.saturating_sub(expires);
            let analysis_id = &name[..name.len() - ANALYSIS_SUFFIX.len()];

            let (removed, survivors) = self.purge_entities(analysis_id, &names, &analyses, cutoff);
            report.removed_entities += removed;
            if survivors {
                continue;
            }
            match modified_millis(&path) {
                Ok(modified) if modified < cutoff => match fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(file = %name, "Deleted expired analysis state");
                        report.removed_analyses += 1;
                    }
                    Err(e) => warn!(file = %name, error = %e, "Unable to delete expired analysis state"),
                },
                Ok(_) => {}
                Err(e) => warn!(file = %name, error = %e, "Unable to read analysis state file"),
            }
        }

        info!(
            removed_analyses = report.removed_analyses,
            removed_entities = report.removed_entities,
            "Expired state documents purged"
        );
        Ok(report)
    }

    fn shutdown(&self) -> Result<()> {
        // Documents are written through on every save
        Ok(())
    }

    fn inspect(
        &self,
        analysis_id: &AnalysisId,
        entity_id: Option<&EntityId>,
        now: i64,
    ) -> Result<Option<InspectedState>> {
        let constants_decoder = DocumentDecoder::new(Mutability::Constant, now);
        let Some((constants, _)) =
            self.read_document(&self.analysis_path(analysis_id), &constants_decoder, Some(i64::MIN))?
        else {
            return Ok(None);
        };
        let variables_decoder = DocumentDecoder::new(Mutability::Variable, now).counting_events(false);
        let variables = match entity_id {
            Some(entity_id) => self.read_document(
                &self.entity_path(analysis_id, entity_id),
                &variables_decoder,
                Some(i64::MIN),
            )?,
            None => None,
        };
        let encoder = DocumentEncoder::new();
        Ok(Some(InspectedState {
            analysis_state: encoder.encode(&constants),
            entity_state: variables.map(|(values, _)| encoder.encode(&values)),
        }))
    }

    fn list(&self) -> Result<Vec<StoredAnalysis>> {
        let names = self.file_names()?;
        let analyses = analysis_ids(&names);
        let mut listed: Vec<StoredAnalysis> = analyses
            .iter()
            .map(|analysis_id| StoredAnalysis {
                analysis_id: AnalysisId::new(*analysis_id),
                entities: Vec::new(),
            })
            .collect();
        for name in &names {
            let Some((owner, entity_id)) = owning_analysis(name, &analyses) else {
                continue;
            };
            if let Some(stored) = listed.iter_mut().find(|stored| stored.analysis_id.as_str() == owner) {
                stored.entities.push(EntityId::new(entity_id));
            }
        }
        listed.sort_by(|a, b| a.analysis_id.cmp(&b.analysis_id));
        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_time_millis;
    use crate::state::NUMBER_EVENTS;
    use std::time::SystemTime;

    struct Fixture {
        _dir: tempfile::TempDir,
        script: PathBuf,
        backend: FileBackend,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("A.capl");
        fs::write(&script, "analysis").unwrap();
        let backend = FileBackend::new(dir.path().join("state"));
        backend.load().unwrap();
        Fixture {
            _dir: dir,
            script,
            backend,
        }
    }

    fn wall_clock() -> i64 {
        system_time_millis(SystemTime::now())
    }

    fn request<'a>(fixture: &'a Fixture, a: &'a AnalysisId, e: &'a EntityId) -> Retrieval<'a> {
        Retrieval {
            script_path: &fixture.script,
            analysis_id: a,
            entity_id: e,
            force_reset: false,
            now: wall_clock(),
        }
    }

    #[test]
    fn test_paths() {
        let backend = FileBackend::new("/tmp/state");
        assert_eq!(
            backend.analysis_path(&AnalysisId::new("A")),
            PathBuf::from("/tmp/state/A-analysisState.json")
        );
        assert_eq!(
            backend.entity_path(&AnalysisId::new("A"), &EntityId::new("E1")),
            PathBuf::from("/tmp/state/A-E1-entityState.json")
        );
    }

    #[test]
    fn test_load_counts_one_event() {
        let fixture = fixture();
        let (a, e) = (AnalysisId::new("A"), EntityId::new("E1"));

        let pair = fixture.backend.retrieve(&request(&fixture, &a, &e)).unwrap();
        assert!(pair.constants.is_new());
        assert_eq!(pair.variables.number_events(), Some(1.0));
        fixture.backend.save(&a, &e, pair).unwrap();

        let pair = fixture.backend.retrieve(&request(&fixture, &a, &e)).unwrap();
        assert!(!pair.constants.is_new());
        assert_eq!(pair.variables.number_events(), Some(2.0));
    }

    #[test]
    fn test_reset_and_new_constants_ignore_entity_document() {
        let fixture = fixture();
        let (a, e) = (AnalysisId::new("A"), EntityId::new("E1"));
        let pair = fixture.backend.retrieve(&request(&fixture, &a, &e)).unwrap();
        fixture.backend.save(&a, &e, pair).unwrap();

        let reset = Retrieval {
            force_reset: true,
            ..request(&fixture, &a, &e)
        };
        let pair = fixture.backend.retrieve(&reset).unwrap();
        assert_eq!(pair.variables.number_events(), Some(1.0));

        fs::remove_file(fixture.backend.analysis_path(&a)).unwrap();
        let pair = fixture.backend.retrieve(&request(&fixture, &a, &e)).unwrap();
        assert!(pair.constants.is_new());
        assert_eq!(pair.variables.number_events(), Some(1.0));
    }

    #[test]
    fn test_corrupt_document_is_reported() {
        let fixture = fixture();
        let (a, e) = (AnalysisId::new("A"), EntityId::new("E1"));
        fs::write(fixture.backend.analysis_path(&a), r#"{"set*x*bad": []}"#).unwrap();

        let err = fixture
            .backend
            .retrieve(&request(&fixture, &a, &e))
            .unwrap_err();
        assert!(matches!(err, StateError::CorruptStateDocument { .. }));
    }

    #[test]
    fn test_blank_document_is_fresh() {
        let fixture = fixture();
        let (a, e) = (AnalysisId::new("A"), EntityId::new("E1"));
        fs::write(fixture.backend.analysis_path(&a), "  \n").unwrap();
        let pair = fixture.backend.retrieve(&request(&fixture, &a, &e)).unwrap();
        assert!(pair.constants.is_new());
    }

    #[test]
    fn test_sweep_deletes_expired_documents() {
        let fixture = fixture();
        let a = AnalysisId::new("A");
        let e = EntityId::new("E1");
        let mut pair = fixture.backend.retrieve(&request(&fixture, &a, &e)).unwrap();
        pair.constants
            .values_mut()
            .insert(EXPIRES, Value::number(1_000.0));
        fixture.backend.save(&a, &e, pair).unwrap();

        let report = fixture.backend.sweep(wall_clock()).unwrap();
        assert!(report.is_empty());

        let report = fixture.backend.sweep(wall_clock() + 60_000).unwrap();
        assert_eq!(
            report,
            SweepReport {
                removed_analyses: 1,
                removed_entities: 1
            }
        );
        assert!(fixture.backend.list().unwrap().is_empty());
    }

    #[test]
    fn test_sweep_leaves_documents_of_longer_analysis_ids() {
        let fixture = fixture();
        let (short, long) = (AnalysisId::new("a"), AnalysisId::new("a-b"));
        let x = EntityId::new("x");
        let fresh_pair = || StatePair {
            constants: AnalysisState::new(Mutability::Constant, 0),
            variables: AnalysisState::new(Mutability::Variable, 0),
        };

        let mut pair = fresh_pair();
        pair.constants
            .values_mut()
            .insert(EXPIRES, Value::number(1_000.0));
        fixture.backend.save(&short, &x, pair).unwrap();
        fixture.backend.save(&long, &x, fresh_pair()).unwrap();

        let listed = fixture.backend.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].analysis_id, short);
        assert_eq!(listed[0].entities, vec![x.clone()]);
        assert_eq!(listed[1].analysis_id, long);
        assert_eq!(listed[1].entities, vec![x.clone()]);

        let report = fixture.backend.sweep(wall_clock() + 60_000).unwrap();
        assert_eq!(report.removed_entities, 1);
        assert!(!fixture.backend.entity_path(&short, &x).exists());
        assert!(fixture.backend.entity_path(&long, &x).exists());
        assert!(fixture.backend.analysis_path(&long).exists());
    }

    #[test]
    fn test_owning_analysis_prefers_longest_id() {
        let names = vec![
            "a-analysisState.json".to_string(),
            "a-b-analysisState.json".to_string(),
        ];
        let analyses = analysis_ids(&names);
        assert_eq!(analyses, vec!["a-b", "a"]);
        assert_eq!(
            owning_analysis("a-b-x-entityState.json", &analyses),
            Some(("a-b", "x"))
        );
        assert_eq!(
            owning_analysis("a-c-entityState.json", &analyses),
            Some(("a", "c"))
        );
        assert_eq!(owning_analysis("z-x-entityState.json", &analyses), None);
        assert_eq!(owning_analysis("a-analysisState.json", &analyses), None);
    }

    #[test]
    fn test_inspect_does_not_count_events() {
        let fixture = fixture();
        let (a, e) = (AnalysisId::new("A"), EntityId::new("E1"));
        let pair = fixture.backend.retrieve(&request(&fixture, &a, &e)).unwrap();
        fixture.backend.save(&a, &e, pair).unwrap();

        let inspected = fixture
            .backend
            .inspect(&a, Some(&e), wall_clock())
            .unwrap()
            .unwrap();
        assert_eq!(
            inspected.entity_state.unwrap()[NUMBER_EVENTS],
            serde_json::json!(1.0)
        );

        let listed = fixture.backend.list().unwrap();
        assert_eq!(listed[0].analysis_id, a);
        assert_eq!(listed[0].entities, vec![e]);
    }
}
