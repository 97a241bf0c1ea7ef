use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use scanplane_model::{
    BaseResourceType, BaseResourceTypeId, Check, CheckId, CheckOutcome,
    CheckOwner, CheckState, Resource, ResourceId, ResourceType, ResourceTypeId,
};
use tokio::sync::RwLock;
use tracing::trace;

use super::{CheckStore, NewCheck};
use crate::error::{BackendError, BackendResult};

#[derive(Debug, Default)]
struct StoreState {
    base_resource_types: BTreeMap<BaseResourceTypeId, BaseResourceType>,
    resource_types: BTreeMap<ResourceTypeId, ResourceType>,
    resources: BTreeMap<ResourceId, Resource>,
    /// Insertion ordered.
    checks: Vec<Check>,
}

impl StoreState {
    fn missing_reference(&self, check: &NewCheck) -> Option<CheckOwner> {
        if let Some(id) = check.resource_id
            && !self.resources.contains_key(&id)
        {
            return Some(CheckOwner::Resource(id));
        }
        if let Some(id) = check.resource_type_id
            && !self.resource_types.contains_key(&id)
        {
            return Some(CheckOwner::ResourceType(id));
        }
        if let Some(id) = check.base_resource_type_id
            && !self.base_resource_types.contains_key(&id)
        {
            return Some(CheckOwner::BaseResourceType(id));
        }
        None
    }
}

/// In-memory check store. The existence check and the insert happen under one
/// write guard, which gives the same atomicity the Postgres partial unique
/// index provides.
#[derive(Clone, Default)]
pub struct InMemoryCheckStore {
    state: Arc<RwLock<StoreState>>,
}

impl fmt::Debug for InMemoryCheckStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryCheckStore");
        match self.state.try_read() {
            Ok(state) => {
                debug
                    .field("resources", &state.resources.len())
                    .field("resource_types", &state.resource_types.len())
                    .field("checks", &state.checks.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryCheckStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_base_resource_type(&self, base: BaseResourceType) {
        let mut state = self.state.write().await;
        state.base_resource_types.insert(base.id, base);
    }

    pub async fn upsert_resource_type(&self, resource_type: ResourceType) {
        let mut state = self.state.write().await;
        state.resource_types.insert(resource_type.id, resource_type);
    }

    pub async fn upsert_resource(&self, resource: Resource) {
        let mut state = self.state.write().await;
        state.resources.insert(resource.id, resource);
    }

    /// Removes a resource from configuration. Its checks are kept.
    pub async fn remove_resource(&self, id: ResourceId) -> Option<Resource> {
        let mut state = self.state.write().await;
        state.resources.remove(&id)
    }

    pub async fn check_count(&self) -> usize {
        self.state.read().await.checks.len()
    }
}

#[async_trait]
impl CheckStore for InMemoryCheckStore {
    async fn insert_check_if_absent(
        &self,
        check: NewCheck,
    ) -> BackendResult<CheckOutcome> {
        let mut state = self.state.write().await;

        if let Some(owner) = state.missing_reference(&check) {
            return Err(BackendError::MissingReference(owner));
        }

        if let Some(existing) = state.checks.iter().find(|existing| {
            existing.state.is_active()
                && existing.owner == check.owner
                && existing.plan_fingerprint == check.plan_fingerprint
        }) {
            trace!(
                check_id = %existing.id,
                owner = %check.owner,
                "active check already exists"
            );
            return Ok(CheckOutcome::AlreadyExists(existing.clone()));
        }

        let created = Check {
            id: CheckId::new(),
            owner: check.owner,
            resource_id: check.resource_id,
            resource_type_id: check.resource_type_id,
            base_resource_type_id: check.base_resource_type_id,
            plan: check.plan,
            plan_fingerprint: check.plan_fingerprint,
            state: CheckState::Pending,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
        };
        trace!(
            check_id = %created.id,
            owner = %created.owner,
            "inserted pending check"
        );

        state.checks.push(created.clone());
        Ok(CheckOutcome::Created(created))
    }

    async fn list_resource_types(&self) -> BackendResult<Vec<ResourceType>> {
        let state = self.state.read().await;
        Ok(state.resource_types.values().cloned().collect())
    }

    async fn list_resources(&self) -> BackendResult<Vec<Resource>> {
        let state = self.state.read().await;
        Ok(state.resources.values().cloned().collect())
    }

    async fn list_base_resource_types(
        &self,
    ) -> BackendResult<Vec<BaseResourceType>> {
        let state = self.state.read().await;
        Ok(state.base_resource_types.values().cloned().collect())
    }

    async fn list_checks_by_state(
        &self,
        state: CheckState,
    ) -> BackendResult<Vec<Check>> {
        let guard = self.state.read().await;
        Ok(guard
            .checks
            .iter()
            .filter(|check| check.state == state)
            .cloned()
            .collect())
    }

    async fn find_check(&self, id: CheckId) -> BackendResult<Option<Check>> {
        let state = self.state.read().await;
        Ok(state.checks.iter().find(|check| check.id == id).cloned())
    }

    async fn transition_check(
        &self,
        id: CheckId,
        to: CheckState,
    ) -> BackendResult<Check> {
        let mut state = self.state.write().await;
        let check = state
            .checks
            .iter_mut()
            .find(|check| check.id == id)
            .ok_or(BackendError::CheckNotFound(id))?;

        if !check.state.can_transition_to(to) {
            return Err(BackendError::InvalidTransition {
                check_id: id,
                from: check.state,
                to,
            });
        }

        let now = Utc::now();
        check.state = to;
        if to == CheckState::Started {
            check.start_time = Some(now);
        }
        if to.is_terminal() {
            check.end_time = Some(now);
        }
        Ok(check.clone())
    }
}
