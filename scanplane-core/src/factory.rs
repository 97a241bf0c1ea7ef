//! The check factory: scanning-lock acquisition and deduplicated check
//! creation.
//!
//! Both entrypoints are independently safe under concurrency. Creating a check
//! does not require the scanning lock; same-tuple serialization is left to the
//! store's insert-if-absent primitive.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use scanplane_model::{
    BaseResourceType, BaseResourceTypeId, Check, CheckOutcome, CheckOwner,
    CheckState, PipelineId, Plan, Resource, ResourceId, ResourceType,
    ResourceTypeId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    error::{BackendError, Result, ScanError},
    lock::{LockAttempt, LockBackend, LockScope},
    store::{CheckStore, NewCheck},
};

/// Request to schedule a scan.
///
/// The owner is the resource when given, otherwise the resource type,
/// otherwise the base resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub resource_id: Option<ResourceId>,
    pub resource_type_id: Option<ResourceTypeId>,
    pub base_resource_type_id: Option<BaseResourceTypeId>,
    pub plan: Plan,
}

impl CheckRequest {
    pub fn for_resource(resource_id: ResourceId, plan: Plan) -> Self {
        Self {
            resource_id: Some(resource_id),
            resource_type_id: None,
            base_resource_type_id: None,
            plan,
        }
    }

    pub fn for_resource_type(
        resource_type_id: ResourceTypeId,
        plan: Plan,
    ) -> Self {
        Self {
            resource_id: None,
            resource_type_id: Some(resource_type_id),
            base_resource_type_id: None,
            plan,
        }
    }

    pub fn with_resource_type(mut self, id: ResourceTypeId) -> Self {
        self.resource_type_id = Some(id);
        self
    }

    pub fn with_base_resource_type(mut self, id: BaseResourceTypeId) -> Self {
        self.base_resource_type_id = Some(id);
        self
    }

    pub fn owner(&self) -> Option<CheckOwner> {
        CheckOwner::resolve(
            self.resource_id,
            self.resource_type_id,
            self.base_resource_type_id,
        )
    }
}

#[async_trait]
pub trait CheckFactory: Send + Sync {
    /// Single non-blocking attempt at the global scanning lock.
    async fn acquire_scanning_lock(&self) -> Result<LockAttempt>;

    /// Same contract as [`CheckFactory::acquire_scanning_lock`], scoped to one
    /// pipeline.
    async fn acquire_pipeline_scanning_lock(
        &self,
        pipeline_id: PipelineId,
    ) -> Result<LockAttempt>;

    /// Creates a pending check or returns the equivalent active one.
    async fn create_check(&self, request: CheckRequest) -> Result<CheckOutcome>;

    async fn resource_types(&self) -> Result<Vec<ResourceType>>;

    async fn resources(&self) -> Result<Vec<Resource>>;

    async fn base_resource_types(&self) -> Result<Vec<BaseResourceType>>;

    /// Checks currently in the `started` state.
    async fn started_checks(&self) -> Result<Vec<Check>>;
}

/// Factory delegating to a lock backend and a check store.
#[derive(Clone)]
pub struct DefaultCheckFactory {
    store: Arc<dyn CheckStore>,
    locks: Arc<dyn LockBackend>,
}

impl fmt::Debug for DefaultCheckFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultCheckFactory").finish_non_exhaustive()
    }
}

impl DefaultCheckFactory {
    pub fn new(
        store: Arc<dyn CheckStore>,
        locks: Arc<dyn LockBackend>,
    ) -> Self {
        Self { store, locks }
    }

    pub fn store(&self) -> Arc<dyn CheckStore> {
        Arc::clone(&self.store)
    }

    async fn acquire(&self, scope: LockScope) -> Result<LockAttempt> {
        let attempt = self.locks.try_acquire(scope).await.map_err(|source| {
            ScanError::Lock {
                operation: "acquiring scanning lock",
                scope,
                source,
            }
        })?;

        if attempt.acquired() {
            debug!(%scope, "scanning lock acquired");
        } else {
            debug!(%scope, "scanning lock held elsewhere; skipping cycle");
        }
        Ok(attempt)
    }
}

#[async_trait]
impl CheckFactory for DefaultCheckFactory {
    #[instrument(
        name = "check_factory.acquire_scanning_lock",
        skip(self),
        level = "debug",
        err
    )]
    async fn acquire_scanning_lock(&self) -> Result<LockAttempt> {
        self.acquire(LockScope::Global).await
    }

    #[instrument(
        name = "check_factory.acquire_pipeline_scanning_lock",
        skip(self),
        level = "debug",
        err
    )]
    async fn acquire_pipeline_scanning_lock(
        &self,
        pipeline_id: PipelineId,
    ) -> Result<LockAttempt> {
        self.acquire(LockScope::Pipeline(pipeline_id)).await
    }

    #[instrument(
        name = "check_factory.create_check",
        skip(self, request),
        fields(
            resource_id = ?request.resource_id,
            resource_type_id = ?request.resource_type_id,
            base_resource_type_id = ?request.base_resource_type_id,
            plan_id = %request.plan.id
        ),
        err
    )]
    async fn create_check(
        &self,
        request: CheckRequest,
    ) -> Result<CheckOutcome> {
        let owner = request.owner().ok_or(ScanError::MissingOwner)?;

        request
            .plan
            .validate()
            .map_err(|source| ScanError::InvalidPlan {
                owner: owner.to_string(),
                source,
            })?;

        let plan_fingerprint = request.plan.fingerprint().map_err(|err| {
            ScanError::store(
                "fingerprinting plan",
                owner.to_string(),
                BackendError::Model(err),
            )
        })?;

        let new_check = NewCheck {
            owner,
            resource_id: request.resource_id,
            resource_type_id: request.resource_type_id,
            base_resource_type_id: request.base_resource_type_id,
            plan: request.plan,
            plan_fingerprint,
        };

        let outcome = self
            .store
            .insert_check_if_absent(new_check)
            .await
            .map_err(|err| match err {
                BackendError::MissingReference(missing) => {
                    ScanError::UnknownOwner(missing)
                }
                other => {
                    ScanError::store("creating check", owner.to_string(), other)
                }
            })?;

        match &outcome {
            CheckOutcome::Created(check) => info!(
                check_id = %check.id,
                %owner,
                plan_fingerprint = %check.plan_fingerprint,
                "created check"
            ),
            CheckOutcome::AlreadyExists(check) => debug!(
                check_id = %check.id,
                %owner,
                state = %check.state,
                "equivalent check already active"
            ),
        }

        Ok(outcome)
    }

    async fn resource_types(&self) -> Result<Vec<ResourceType>> {
        self.store.list_resource_types().await.map_err(|err| {
            ScanError::store("listing resource types", "all pipelines", err)
        })
    }

    async fn resources(&self) -> Result<Vec<Resource>> {
        self.store.list_resources().await.map_err(|err| {
            ScanError::store("listing resources", "all pipelines", err)
        })
    }

    async fn base_resource_types(&self) -> Result<Vec<BaseResourceType>> {
        self.store.list_base_resource_types().await.map_err(|err| {
            ScanError::store("listing base resource types", "workers", err)
        })
    }

    async fn started_checks(&self) -> Result<Vec<Check>> {
        self.store
            .list_checks_by_state(CheckState::Started)
            .await
            .map_err(|err| {
                ScanError::store("listing started checks", "all checks", err)
            })
    }
}
