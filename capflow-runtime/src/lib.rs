//! # capflow-runtime
//!
//! Runs analyses against persisted state: request serialization, the
//! single-slot analysis cache, chained pipelines, the background expiry
//! sweeper and orderly shutdown.

pub mod cache;
pub mod error;
pub mod interpreter;
pub mod locks;
pub mod pipeline;
pub mod script;
pub mod service;
pub mod sweeper;

pub use cache::{AnalysisCache, CachedAnalysis};
pub use error::{AnalysisError, Result};
pub use interpreter::{Evaluation, Interpreter, ResultDocument};
pub use locks::{EntityLocks, ExecutionPolicy};
pub use pipeline::{Pipeline, PipelineStage};
pub use script::{instantiate, load_script, parse_substitutions};
pub use service::{AnalysisRequest, AnalysisService, ServiceOptions};
pub use sweeper::{SweepFn, Sweeper};
