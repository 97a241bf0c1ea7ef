//! Cluster-wide scanning locks.
//!
//! Acquisition is a single non-blocking attempt. Losing the race is reported
//! as [`LockAttempt::Held`], never as an error; retry cadence belongs to the
//! caller's polling loop.

use std::fmt;

use async_trait::async_trait;
use scanplane_model::PipelineId;
use serde::{Deserialize, Serialize};

use crate::error::BackendResult;

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::InMemoryLockBackend;
#[cfg(feature = "postgres")]
pub use postgres::PostgresLockBackend;

/// What a scanning lock protects.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "pipeline_id", rename_all = "snake_case")]
pub enum LockScope {
    Global,
    Pipeline(PipelineId),
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Global => write!(f, "global scanning"),
            LockScope::Pipeline(id) => write!(f, "pipeline {id} scanning"),
        }
    }
}

/// 64-bit key handed to the lock primitive.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct LockId(pub i64);

impl LockId {
    const GLOBAL_SCANNING: i64 = 0x7363_616e;
    const PIPELINE_SCANNING_BASE: i64 = 1 << 40;

    pub fn for_scope(scope: LockScope) -> Self {
        match scope {
            LockScope::Global => Self(Self::GLOBAL_SCANNING),
            LockScope::Pipeline(id) => {
                Self(Self::PIPELINE_SCANNING_BASE.wrapping_add(id.get()))
            }
        }
    }
}

/// A held lock. Dropping an unreleased handle releases it.
#[async_trait]
pub trait Lock: Send + Sync + fmt::Debug {
    fn scope(&self) -> LockScope;

    /// Releases the lock. The first call unlocks; later calls are no-ops. A
    /// lock whose backend connection was lost is already free and releases
    /// successfully.
    async fn release(&self) -> BackendResult<()>;
}

/// Outcome of a single non-blocking acquisition attempt.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(Box<dyn Lock>),
    /// Another holder owns the scope; skip this cycle.
    Held,
}

impl LockAttempt {
    pub fn acquired(&self) -> bool {
        matches!(self, LockAttempt::Acquired(_))
    }

    pub fn into_lock(self) -> Option<Box<dyn Lock>> {
        match self {
            LockAttempt::Acquired(lock) => Some(lock),
            LockAttempt::Held => None,
        }
    }
}

/// Abstracts the distributed lock primitive.
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn try_acquire(&self, scope: LockScope) -> BackendResult<LockAttempt>;
}
