use capflow_core::StateError;
use capflow_types::{AnalysisId, EntityId};

/// Errors surfaced to callers of the analysis service
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error(
        "The cached analysis was generated for a different entity / analysis ID combination: \
         cached entity ID = \"{cached_entity}\", new entity ID = \"{entity}\", \
         cached analysis ID = \"{cached_analysis}\", new analysis ID = \"{analysis}\""
    )]
    StaleCacheMismatch {
        cached_entity: EntityId,
        cached_analysis: AnalysisId,
        entity: EntityId,
        analysis: AnalysisId,
    },

    #[error("Unknown analysis \"{0}\"")]
    UnknownAnalysis(AnalysisId),

    #[error("Script of analysis \"{0}\" is empty")]
    EmptyScript(AnalysisId),

    #[error("Invalid variable substitutions \"{given}\": {reason}")]
    InvalidSubstitutions { given: String, reason: String },

    #[error("Evaluation of analysis \"{analysis}\" for entity \"{entity}\" failed: {message}")]
    EvaluationFailed {
        analysis: AnalysisId,
        entity: EntityId,
        message: String,
    },

    #[error("The cached analysis state does not contain an event counter")]
    MissingEventCounter,

    #[error(transparent)]
    State(#[from] StateError),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
