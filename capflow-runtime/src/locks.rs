//! Request serialization
//!
//! The file backend lets requests for different entities run in parallel
//! and serializes requests for the same entity. The delegating backend
//! shares one mutable index, so all of its work goes through a single
//! writer.

use capflow_core::BackendKind;
use capflow_types::EntityId;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// One lock per entity, created on first use
#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: DashMap<EntityId, Arc<Mutex<()>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, entity_id: &EntityId) -> Arc<Mutex<()>> {
        self.locks.entry(entity_id.clone()).or_default().clone()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// How requests against a backend are serialized
#[derive(Debug)]
pub enum ExecutionPolicy {
    /// Requests hold the gate shared and their entity's lock exclusively
    PerEntity {
        locks: EntityLocks,
        gate: RwLock<()>,
    },
    /// Every request and sweep runs under one lock
    SingleWriter(Mutex<()>),
}

impl ExecutionPolicy {
    pub fn for_backend(kind: BackendKind) -> Self {
        match kind {
            BackendKind::File => ExecutionPolicy::PerEntity {
                locks: EntityLocks::new(),
                gate: RwLock::new(()),
            },
            BackendKind::ObjectStore => ExecutionPolicy::SingleWriter(Mutex::new(())),
        }
    }

    /// Run a request for `entity_id`
    pub fn run<R>(&self, entity_id: &EntityId, f: impl FnOnce() -> R) -> R {
        match self {
            ExecutionPolicy::PerEntity { locks, gate } => {
                let _shared = gate.read();
                let lock = locks.lock_for(entity_id);
                let _entity = lock.lock();
                f()
            }
            ExecutionPolicy::SingleWriter(writer) => {
                let _writer = writer.lock();
                f()
            }
        }
    }

    /// Run with no request in flight
    pub fn run_exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        match self {
            ExecutionPolicy::PerEntity { gate, .. } => {
                let _exclusive = gate.write();
                f()
            }
            ExecutionPolicy::SingleWriter(writer) => {
                let _writer = writer.lock();
                f()
            }
        }
    }
}
