//! # capflow-core
//!
//! State and value engine for capflow analyses.
//!
//! This crate provides the recursive value model with bounded and
//! time-windowed collections, the analysis state lifecycle, the JSON state
//! document codec, and the two persistence backends.

pub mod backend;
pub mod clock;
pub mod codec;
pub mod collection;
pub mod config;
pub mod error;
pub mod state;
pub mod store;
pub mod value;

pub use backend::{
    open_backend, DelegatingBackend, FileBackend, InspectedState, Retrieval, StateBackend,
    StoredAnalysis,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{CodecError, DocumentDecoder, DocumentEncoder};
pub use collection::{combine, difference, ValueList, ValueMap, ValueSet};
pub use config::{BackendKind, CapflowConfig, ConfigError};
pub use error::{Result, StateError};
pub use state::{
    AllAnalysesStates, AnalysisState, StateIndex, StatePair, SweepReport, EXPIRES, NOW,
    NUMBER_EVENTS,
};
pub use store::{MemoryStore, ObjectStore, SnapshotStore, StoreTarget};
pub use value::{Data, NumericOp, Value, ValueError, ValueKind, ValueOrder};
