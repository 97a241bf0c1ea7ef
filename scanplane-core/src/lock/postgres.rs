use std::fmt;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, pool::PoolConnection};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Lock, LockAttempt, LockBackend, LockId, LockScope};
use crate::error::BackendResult;

/// Session-level Postgres advisory locks.
///
/// A successful attempt pins one pooled connection for the lifetime of the
/// handle. If the holder process dies its session ends and Postgres frees the
/// lock, so no lease bookkeeping is needed here.
#[derive(Clone)]
pub struct PostgresLockBackend {
    pool: PgPool,
}

impl fmt::Debug for PostgresLockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresLockBackend")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresLockBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockBackend for PostgresLockBackend {
    async fn try_acquire(
        &self,
        scope: LockScope,
    ) -> BackendResult<LockAttempt> {
        let id = LockId::for_scope(scope);
        let mut conn = self.pool.acquire().await?;

        let acquired: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(id.0)
                .fetch_one(&mut *conn)
                .await?;

        if !acquired {
            debug!(
                %scope,
                lock_id = id.0,
                "advisory lock held by another session"
            );
            return Ok(LockAttempt::Held);
        }

        debug!(%scope, lock_id = id.0, "advisory lock acquired");
        Ok(LockAttempt::Acquired(Box::new(PostgresLock {
            scope,
            id,
            conn: Mutex::new(Some(conn)),
        })))
    }
}

struct PostgresLock {
    scope: LockScope,
    id: LockId,
    conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl fmt::Debug for PostgresLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresLock")
            .field("scope", &self.scope)
            .field("lock_id", &self.id.0)
            .finish()
    }
}

#[async_trait]
impl Lock for PostgresLock {
    fn scope(&self) -> LockScope {
        self.scope
    }

    async fn release(&self) -> BackendResult<()> {
        let Some(mut conn) = self.conn.lock().await.take() else {
            return Ok(());
        };

        let unlocked =
            sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                .bind(self.id.0)
                .fetch_one(&mut *conn)
                .await;

        match unlocked {
            Ok(true) => {
                debug!(scope = %self.scope, "advisory lock released");
            }
            Ok(false) => {
                // The session no longer owns the lock; never hand it back to
                // the pool in an unknown state.
                warn!(
                    scope = %self.scope,
                    "advisory lock was not held at release"
                );
                drop(conn.detach());
            }
            Err(err) => {
                // Closing the session frees any advisory lock it still holds.
                warn!(
                    scope = %self.scope,
                    error = %err,
                    "advisory unlock failed; closing session"
                );
                drop(conn.detach());
            }
        }

        Ok(())
    }
}

impl Drop for PostgresLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.get_mut().take() {
            warn!(
                scope = %self.scope,
                "lock dropped without release; closing session"
            );

            drop(conn.detach());
        }
    }
}
