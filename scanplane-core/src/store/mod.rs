//! Durable storage for checks and the pipeline configuration they scan.

use async_trait::async_trait;
use scanplane_model::{
    BaseResourceType, BaseResourceTypeId, Check, CheckId, CheckOutcome,
    CheckOwner, CheckState, Plan, PlanFingerprint, Resource, ResourceId,
    ResourceType, ResourceTypeId,
};

use crate::error::BackendResult;

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::InMemoryCheckStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresCheckStore;

/// A validated, fingerprinted check ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCheck {
    pub owner: CheckOwner,
    pub resource_id: Option<ResourceId>,
    pub resource_type_id: Option<ResourceTypeId>,
    pub base_resource_type_id: Option<BaseResourceTypeId>,
    pub plan: Plan,
    pub plan_fingerprint: PlanFingerprint,
}

/// Abstracts the check store consumed by the factory.
#[async_trait]
pub trait CheckStore: Send + Sync {
    /// Inserts a pending check unless an active check with the same owner and
    /// plan fingerprint exists, in which case that check is returned. Atomic
    /// with respect to concurrent callers for the same key.
    async fn insert_check_if_absent(
        &self,
        check: NewCheck,
    ) -> BackendResult<CheckOutcome>;

    async fn list_resource_types(&self) -> BackendResult<Vec<ResourceType>>;

    async fn list_resources(&self) -> BackendResult<Vec<Resource>>;

    async fn list_base_resource_types(
        &self,
    ) -> BackendResult<Vec<BaseResourceType>>;

    async fn list_checks_by_state(
        &self,
        state: CheckState,
    ) -> BackendResult<Vec<Check>>;

    async fn find_check(&self, id: CheckId) -> BackendResult<Option<Check>>;

    /// Moves a check along its lifecycle, stamping start/end times. Used by
    /// the scan executor.
    async fn transition_check(
        &self,
        id: CheckId,
        to: CheckState,
    ) -> BackendResult<Check>;
}
