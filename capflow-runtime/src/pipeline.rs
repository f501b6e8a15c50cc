//! Chained analyses
//!
//! A pipeline is a sequence of (entity, analysis) stages. The first stage
//! receives the incoming event and every later stage receives the output of
//! the stage before it. A pipeline ends early once a stage produces no
//! output.

use crate::error::Result;
use crate::interpreter::ResultDocument;
use capflow_types::{AnalysisId, EntityId};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStage {
    pub entity_id: EntityId,
    pub analysis_id: AnalysisId,
}

impl PipelineStage {
    pub fn new(entity_id: impl Into<EntityId>, analysis_id: impl Into<AnalysisId>) -> Self {
        Self {
            entity_id: entity_id.into(),
            analysis_id: analysis_id.into(),
        }
    }
}

/// A non-empty sequence of stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    /// `None` if `stages` is empty
    pub fn new(stages: Vec<PipelineStage>) -> Option<Self> {
        if stages.is_empty() {
            None
        } else {
            Some(Self { stages })
        }
    }

    pub fn single(stage: PipelineStage) -> Self {
        Self {
            stages: vec![stage],
        }
    }

    pub fn then(mut self, stage: PipelineStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    /// Run every stage through `run_stage`
    ///
    /// A failing first stage becomes a failed result; a failing later stage
    /// is returned as the error of the whole run.
    pub fn run<F>(&self, event: &Json, mut run_stage: F) -> Result<ResultDocument>
    where
        F: FnMut(&PipelineStage, Json) -> Result<ResultDocument>,
    {
        let Some((first, rest)) = self.stages.split_first() else {
            return Ok(ResultDocument::failed("Pipeline has no stages"));
        };
        let mut result = match run_stage(first, event.clone()) {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    analysis = %first.analysis_id,
                    entity = %first.entity_id,
                    error = %e,
                    "First pipeline stage failed"
                );
                return Ok(ResultDocument::failed(e.to_string()));
            }
        };
        for stage in rest {
            if result.output_is_empty() {
                debug!(analysis = %stage.analysis_id, "Pipeline stopped on empty output");
                break;
            }
            result = run_stage(stage, result.output.clone())?;
        }
        Ok(result)
    }
}

/// Run each pipeline on the same event, one result per pipeline
pub fn run_pipelines<F>(
    pipelines: &[Pipeline],
    event: &Json,
    mut run_stage: F,
) -> Result<Vec<ResultDocument>>
where
    F: FnMut(&PipelineStage, Json) -> Result<ResultDocument>,
{
    pipelines
        .iter()
        .map(|pipeline| pipeline.run(event, &mut run_stage))
        .collect()
}
