use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tracing::debug;
use uuid::Uuid;

use super::{Lock, LockAttempt, LockBackend, LockScope};
use crate::error::BackendResult;

/// Process-local lock table. Suitable for tests and single-node setups where
/// every scanner shares one process.
#[derive(Clone, Default)]
pub struct InMemoryLockBackend {
    held: Arc<DashMap<LockScope, Uuid>>,
}

impl fmt::Debug for InMemoryLockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryLockBackend")
            .field("held", &self.held.len())
            .finish()
    }
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, scope: LockScope) -> bool {
        self.held.contains_key(&scope)
    }

    /// Drops the holder's claim as if its connection had died.
    pub fn sever(&self, scope: LockScope) -> bool {
        self.held.remove(&scope).is_some()
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(
        &self,
        scope: LockScope,
    ) -> BackendResult<LockAttempt> {
        match self.held.entry(scope) {
            Entry::Occupied(_) => {
                debug!(%scope, "lock already held");
                Ok(LockAttempt::Held)
            }
            Entry::Vacant(slot) => {
                let token = Uuid::now_v7();
                slot.insert(token);
                debug!(%scope, "lock acquired");
                Ok(LockAttempt::Acquired(Box::new(InMemoryLock {
                    scope,
                    token,
                    held: Arc::clone(&self.held),
                    released: AtomicBool::new(false),
                })))
            }
        }
    }
}

struct InMemoryLock {
    scope: LockScope,
    token: Uuid,
    held: Arc<DashMap<LockScope, Uuid>>,
    released: AtomicBool,
}

impl InMemoryLock {
    fn release_once(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        // A severed claim may have been re-acquired by someone else; only
        // remove our own token.
        self.held
            .remove_if(&self.scope, |_, token| *token == self.token);
    }
}

impl fmt::Debug for InMemoryLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryLock")
            .field("scope", &self.scope)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

#[async_trait]
impl Lock for InMemoryLock {
    fn scope(&self) -> LockScope {
        self.scope
    }

    async fn release(&self) -> BackendResult<()> {
        self.release_once();
        Ok(())
    }
}

impl Drop for InMemoryLock {
    fn drop(&mut self) {
        self.release_once();
    }
}
