//! Boundary to the script interpreter
//!
//! The interpreter itself lives outside this workspace. A run hands it the
//! instantiated script, the mutable constant and variable maps of the
//! retrieved state, and the incoming event; it answers with a
//! [`ResultDocument`].

use capflow_core::{DocumentEncoder, ValueMap};
use capflow_types::{AnalysisId, EntityId, Mutability};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultDocument {
    pub success: bool,
    #[serde(default)]
    pub output: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_state: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_state: Option<Json>,
}

impl ResultDocument {
    pub fn succeeded(output: Json) -> Self {
        Self {
            success: true,
            output,
            message: None,
            analysis_state: None,
            entity_state: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Json::Null,
            message: Some(message.into()),
            analysis_state: None,
            entity_state: None,
        }
    }

    /// Attach decorated renderings of the state maps
    pub fn with_states(mut self, constants: &ValueMap, variables: &ValueMap) -> Self {
        let encoder = DocumentEncoder::new().decorated(true);
        self.analysis_state = Some(encoder.scoped(Mutability::Constant).encode(constants));
        self.entity_state = Some(encoder.scoped(Mutability::Variable).encode(variables));
        self
    }

    /// The document returned to callers never carries state
    pub fn without_states(mut self) -> Self {
        self.analysis_state = None;
        self.entity_state = None;
        self
    }

    /// True when there is nothing to forward to a following pipeline stage
    pub fn output_is_empty(&self) -> bool {
        match &self.output {
            Json::Null => true,
            Json::String(text) => text.is_empty(),
            Json::Array(items) => items.is_empty(),
            Json::Object(members) => members.is_empty(),
            Json::Bool(_) | Json::Number(_) => false,
        }
    }
}

/// Inputs of one evaluation
pub struct Evaluation<'a> {
    pub analysis_id: &'a AnalysisId,
    pub entity_id: &'a EntityId,
    /// Script text with substitutions applied
    pub script: &'a str,
    pub constants: &'a mut ValueMap,
    pub variables: &'a mut ValueMap,
    pub event: &'a Json,
}

/// Evaluates an analysis script against an event
pub trait Interpreter: Send + Sync {
    fn evaluate(&self, evaluation: Evaluation<'_>) -> ResultDocument;
}

impl<F> Interpreter for F
where
    F: for<'a> Fn(Evaluation<'a>) -> ResultDocument + Send + Sync,
{
    fn evaluate(&self, evaluation: Evaluation<'_>) -> ResultDocument {
        self(evaluation)
    }
}
