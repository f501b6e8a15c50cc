//! Analysis scripts and variable substitutions
//!
//! Substitutions are given as `name:value` pairs separated by commas. Every
//! occurrence of `_@name@_` in the script is replaced by its value.

use crate::error::{AnalysisError, Result};
use capflow_core::StateError;
use capflow_types::AnalysisId;
use std::collections::HashSet;
use std::path::Path;

/// Read the script of `analysis_id`
///
/// A missing script is an unknown analysis; a script with nothing but
/// whitespace is rejected.
pub fn load_script(path: &Path, analysis_id: &AnalysisId) -> Result<String> {
    let script = match std::fs::read_to_string(path) {
        Ok(script) => script,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AnalysisError::UnknownAnalysis(analysis_id.clone()));
        }
        Err(e) => return Err(StateError::io(path, e).into()),
    };
    if script.trim().is_empty() {
        return Err(AnalysisError::EmptyScript(analysis_id.clone()));
    }
    Ok(script)
}

/// Parse `name:value,name:value`
pub fn parse_substitutions(given: &str) -> Result<Vec<(String, String)>> {
    let invalid = |reason: String| AnalysisError::InvalidSubstitutions {
        given: given.to_string(),
        reason,
    };
    let mut seen = HashSet::new();
    let mut substitutions = Vec::new();
    for pair in given.split(',') {
        let Some((name, value)) = pair.split_once(':') else {
            return Err(invalid(format!("\"{}\" is not a name:value pair", pair)));
        };
        if !seen.insert(name) {
            return Err(invalid(format!("variable \"{}\" is given twice", name)));
        }
        substitutions.push((name.to_string(), value.to_string()));
    }
    Ok(substitutions)
}

/// Apply `substitutions` to `script`; blank or absent substitutions leave it as is
pub fn instantiate(script: &str, substitutions: Option<&str>) -> Result<String> {
    let Some(given) = substitutions.filter(|given| !given.trim().is_empty()) else {
        return Ok(script.to_string());
    };
    let mut instantiated = script.to_string();
    for (name, value) in parse_substitutions(given)? {
        instantiated = instantiated.replace(&format!("_@{}@_", name), &value);
    }
    Ok(instantiated)
}
