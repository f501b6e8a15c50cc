//! The analysis service
//!
//! [`AnalysisService`] ties a [`StateBackend`] to an [`Interpreter`]: it
//! serializes requests, retrieves state, evaluates the script, persists the
//! resulting state and runs the expiry sweeper.

use crate::cache::{AnalysisCache, CachedAnalysis};
use crate::error::{AnalysisError, Result};
use crate::interpreter::{Evaluation, Interpreter, ResultDocument};
use crate::locks::ExecutionPolicy;
use crate::pipeline::{self, Pipeline, PipelineStage};
use crate::script::{instantiate, load_script};
use crate::sweeper::{SweepFn, Sweeper};
use capflow_core::{
    BackendKind, CapflowConfig, Clock, Retrieval, StateBackend, StateError, SweepReport,
};
use capflow_types::{AnalysisId, EntityId};
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Settings the service needs beyond the backend itself
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub analysis_dir: PathBuf,
    pub script_extension: String,
    pub sweep_interval: Duration,
}

impl ServiceOptions {
    pub fn from_config(config: &CapflowConfig) -> Self {
        Self {
            analysis_dir: config.analysis_dir(),
            script_extension: config.script_extension.clone(),
            sweep_interval: config.purge_interval(),
        }
    }

    fn script_path(&self, analysis_id: &AnalysisId) -> PathBuf {
        self.analysis_dir
            .join(format!("{}.{}", analysis_id, self.script_extension))
    }
}

/// One event for one entity and analysis
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub analysis_id: AnalysisId,
    pub entity_id: EntityId,
    pub event: Json,
    /// `name:value` pairs applied to the script
    pub substitutions: Option<String>,
    /// Reuse the state of the previous run when it was for the same pair
    pub use_cache: bool,
    /// Discard stored state and the cache before running
    pub reset: bool,
}

impl AnalysisRequest {
    pub fn new(
        analysis_id: impl Into<AnalysisId>,
        entity_id: impl Into<EntityId>,
        event: Json,
    ) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            entity_id: entity_id.into(),
            event,
            substitutions: None,
            use_cache: false,
            reset: false,
        }
    }

    pub fn with_substitutions(mut self, substitutions: impl Into<String>) -> Self {
        self.substitutions = Some(substitutions.into());
        self
    }

    pub fn cached(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    /// The same options applied to another stage and event
    fn for_stage(&self, stage: &PipelineStage, event: Json) -> Self {
        Self {
            analysis_id: stage.analysis_id.clone(),
            entity_id: stage.entity_id.clone(),
            event,
            ..self.clone()
        }
    }
}

struct ServiceInner {
    backend: Arc<dyn StateBackend>,
    interpreter: Arc<dyn Interpreter>,
    clock: Arc<dyn Clock>,
    policy: ExecutionPolicy,
    cache: AnalysisCache,
    options: ServiceOptions,
    terminated: AtomicBool,
    sweeping: AtomicBool,
}

impl ServiceInner {
    fn ensure_running(&self) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(StateError::ShuttingDown.into());
        }
        Ok(())
    }

    fn analyze(&self, request: &AnalysisRequest) -> Result<ResultDocument> {
        self.ensure_running()?;
        self.policy
            .run(&request.entity_id, || self.analyze_locked(request))
    }

    fn analyze_locked(&self, request: &AnalysisRequest) -> Result<ResultDocument> {
        let (analysis_id, entity_id) = (&request.analysis_id, &request.entity_id);
        let now = self.clock.now_millis();

        if request.reset && self.cache.clear() {
            debug!("Cleared cached analysis");
        }
        let use_cache = request.use_cache && self.backend.kind() == BackendKind::File;
        let cached = if use_cache {
            self.cache.checkout(analysis_id, entity_id, now)?
        } else {
            None
        };

        let (script, mut pair) = match cached {
            Some(hit) => {
                debug!(analysis = %analysis_id, entity = %entity_id, "Using cached analysis");
                hit
            }
            None => {
                let script_path = self.options.script_path(analysis_id);
                let script = load_script(&script_path, analysis_id)?;
                let script = instantiate(&script, request.substitutions.as_deref())?;
                let pair = self.backend.retrieve(&Retrieval {
                    script_path: &script_path,
                    analysis_id,
                    entity_id,
                    force_reset: request.reset,
                    now,
                })?;
                (script, pair)
            }
        };

        let result = self.interpreter.evaluate(Evaluation {
            analysis_id,
            entity_id,
            script: &script,
            constants: pair.constants.values_mut(),
            variables: pair.variables.values_mut(),
            event: &request.event,
        });
        if !result.success {
            let message = result.message.unwrap_or_default();
            warn!(analysis = %analysis_id, entity = %entity_id, %message, "Evaluation failed");
            return Err(AnalysisError::EvaluationFailed {
                analysis: analysis_id.clone(),
                entity: entity_id.clone(),
                message,
            });
        }

        if use_cache {
            self.cache.store(CachedAnalysis {
                analysis_id: analysis_id.clone(),
                entity_id: entity_id.clone(),
                script,
                pair,
            });
        } else if let Err(e) = self.backend.save(analysis_id, entity_id, pair) {
            error!(analysis = %analysis_id, entity = %entity_id, error = %e, "Failed to save analysis state");
            return Err(e.into());
        }

        Ok(result.without_states())
    }

    /// One sweep pass, skipped while another pass runs or after shutdown
    fn sweep(&self) -> std::result::Result<Option<SweepReport>, StateError> {
        if self.terminated.load(Ordering::SeqCst) || self.sweeping.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        let result = self
            .policy
            .run_exclusive(|| self.backend.sweep(self.clock.now_millis()));
        self.sweeping.store(false, Ordering::Release);
        result.map(Some)
    }

    /// Write back any cached state and close the backend
    fn flush(&self) -> std::result::Result<(), StateError> {
        self.policy.run_exclusive(|| {
            if let Some(cached) = self.cache.take() {
                debug!(analysis = %cached.analysis_id, entity = %cached.entity_id, "Saving cached analysis");
                self.backend
                    .save(&cached.analysis_id, &cached.entity_id, cached.pair)?;
            }
            self.backend.shutdown()
        })
    }
}

/// Runs analyses against one backend
pub struct AnalysisService {
    inner: Arc<ServiceInner>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl AnalysisService {
    pub fn new(
        backend: Arc<dyn StateBackend>,
        interpreter: Arc<dyn Interpreter>,
        clock: Arc<dyn Clock>,
        options: ServiceOptions,
    ) -> Self {
        let policy = ExecutionPolicy::for_backend(backend.kind());
        Self {
            inner: Arc::new(ServiceInner {
                backend,
                interpreter,
                clock,
                policy,
                cache: AnalysisCache::new(),
                options,
                terminated: AtomicBool::new(false),
                sweeping: AtomicBool::new(false),
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.inner.backend
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.inner.cache
    }

    /// Run one event through one analysis
    ///
    /// Blocks on the entity's lock; async callers should go through
    /// `spawn_blocking`.
    pub fn analyze(&self, request: &AnalysisRequest) -> Result<ResultDocument> {
        self.inner.analyze(request)
    }

    /// Run `event` through each pipeline, using `options` for every stage
    pub fn run_pipelines(
        &self,
        pipelines: &[Pipeline],
        event: &Json,
        options: &AnalysisRequest,
    ) -> Result<Vec<ResultDocument>> {
        pipeline::run_pipelines(pipelines, event, |stage, input| {
            self.analyze(&options.for_stage(stage, input))
        })
    }

    /// Sweep expired state now
    pub fn sweep_now(&self) -> Result<Option<SweepReport>> {
        Ok(self.inner.sweep()?)
    }

    /// Start the periodic sweeper; must be called inside a tokio runtime
    pub fn start_sweeper(&self) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let sweep: SweepFn = Arc::new(move || inner.sweep());
        *slot = Some(Sweeper::spawn(self.inner.options.sweep_interval, sweep));
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Stop the sweeper, let in-flight requests finish and flush state
    ///
    /// Requests made afterwards fail. Calling this twice is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down analysis service");

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }

        let inner = self.inner.clone();
        let flushed = tokio::task::spawn_blocking(move || inner.flush())
            .await
            .map_err(|e| StateError::Persistence(format!("flush task failed: {}", e)))?;
        flushed?;

        info!("Analysis service stopped");
        Ok(())
    }
}
