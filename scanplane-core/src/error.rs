use scanplane_model::{CheckId, CheckOwner, CheckState, ModelError, PlanError};
use thiserror::Error;

use crate::lock::LockScope;

/// Failures reported by collaborators: lock backends and check stores.
#[derive(Error, Debug)]
pub enum BackendError {
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("{0} does not exist")]
    MissingReference(CheckOwner),

    #[error("check {0} not found")]
    CheckNotFound(CheckId),

    #[error("check {check_id} cannot move from {from} to {to}")]
    InvalidTransition {
        check_id: CheckId,
        from: CheckState,
        to: CheckState,
    },

    #[error(
        "insert for {owner} kept racing terminal transitions \
         after {attempts} attempts"
    )]
    Contended { owner: CheckOwner, attempts: u32 },

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

impl BackendError {
    /// Infrastructure failures that a later polling cycle may not hit again.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "postgres")]
            BackendError::Database(_) => true,
            BackendError::Unavailable(_) | BackendError::Contended { .. } => {
                true
            }
            BackendError::MissingReference(_)
            | BackendError::CheckNotFound(_)
            | BackendError::InvalidTransition { .. }
            | BackendError::Corrupt(_)
            | BackendError::Model(_) => false,
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors surfaced by the check factory and the scanner.
///
/// Contention is never represented here: a held lock or an existing check is a
/// normal outcome.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("lock backend failed while {operation} ({scope}): {source}")]
    Lock {
        operation: &'static str,
        scope: LockScope,
        #[source]
        source: BackendError,
    },

    #[error("check store failed while {operation} ({identity}): {source}")]
    Store {
        operation: &'static str,
        identity: String,
        #[source]
        source: BackendError,
    },

    #[error("invalid plan for {owner}: {source}")]
    InvalidPlan {
        owner: String,
        #[source]
        source: PlanError,
    },

    #[error(
        "check request names no resource, resource type \
         or base resource type"
    )]
    MissingOwner,

    #[error("{0} does not exist")]
    UnknownOwner(CheckOwner),
}

impl ScanError {
    pub(crate) fn store(
        operation: &'static str,
        identity: impl Into<String>,
        source: BackendError,
    ) -> Self {
        ScanError::Store {
            operation,
            identity: identity.into(),
            source,
        }
    }

    /// True for infrastructure failures the polling loop should back off and
    /// retry. Validation failures need the caller to correct its input.
    pub fn is_retryable(&self) -> bool {
        match self {
            ScanError::Lock { source, .. }
            | ScanError::Store { source, .. } => source.is_transient(),

            ScanError::InvalidPlan { .. }
            | ScanError::MissingOwner
            | ScanError::UnknownOwner(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
