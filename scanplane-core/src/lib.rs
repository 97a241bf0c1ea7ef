//! # Scanplane Core
//!
//! Check scheduling for the Scanplane control plane: deciding when a scan of
//! pipeline resources may run and creating the deduplicated unit of scan work.
//!
//! ## Overview
//!
//! - **Scanning locks**: cluster-wide, non-blocking lock attempts. Losing the
//!   race is [`LockAttempt::Held`], never an error.
//! - **Check creation**: idempotent insert-if-absent keyed by owner and plan
//!   fingerprint. At most one pending or started check exists per key.
//! - **Scanner**: the periodic loop that plans and submits checks for every
//!   resource and resource type.
//!
//! ## Feature Flags
//!
//! - `postgres` (default): Postgres advisory locks and the sqlx-backed check
//!   store, plus [`MIGRATOR`].
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use scanplane_core::{
//!     CheckFactory, DefaultCheckFactory, InMemoryCheckStore,
//!     InMemoryLockBackend,
//! };
//!
//! async fn scan_once() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = DefaultCheckFactory::new(
//!         Arc::new(InMemoryCheckStore::new()),
//!         Arc::new(InMemoryLockBackend::new()),
//!     );
//!
//!     if let Some(lock) = factory.acquire_scanning_lock().await?.into_lock() {
//!         for resource in factory.resources().await? {
//!             println!("would scan {}", resource.name);
//!         }
//!         lock.release().await?;
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Scanner configuration and loading
pub mod config;
/// Error types for lock, store and factory operations
pub mod error;
/// Scanning-lock acquisition and check creation
pub mod factory;
/// Cluster-wide scanning locks
pub mod lock;
/// Check plan construction from pipeline configuration
pub mod planner;
/// Periodic scanning loop
pub mod scanner;
/// Check persistence
pub mod store;
/// Call recording for factory consumers under test
pub mod testing;

pub use config::{DatabaseConfig, ScannerConfig, ScannerConfigSource};
pub use error::{BackendError, BackendResult, Result, ScanError};
pub use factory::{CheckFactory, CheckRequest, DefaultCheckFactory};
#[cfg(feature = "postgres")]
pub use lock::PostgresLockBackend;
pub use lock::{
    InMemoryLockBackend, Lock, LockAttempt, LockBackend, LockId, LockScope,
};

pub use planner::{CheckPlanner, PlannerError};
pub use scanner::{ScanSummary, Scanner};
#[cfg(feature = "postgres")]
pub use store::PostgresCheckStore;
pub use store::{CheckStore, InMemoryCheckStore, NewCheck};
pub use testing::{Call, CallLog, RecordingCheckFactory};

/// Embedded schema migrations for the Postgres backends.
#[cfg(feature = "postgres")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
