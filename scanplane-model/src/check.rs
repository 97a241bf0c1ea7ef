use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::ModelError,
    ids::{BaseResourceTypeId, CheckId, ResourceId, ResourceTypeId},
    plan::{Plan, PlanFingerprint},
};

/// Lifecycle of a check. Transitions after creation are driven by the scan
/// executor; the factory only ever inserts `Pending`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Pending,
    Started,
    Succeeded,
    Errored,
    Skipped,
}

impl CheckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckState::Pending => "pending",
            CheckState::Started => "started",
            CheckState::Succeeded => "succeeded",
            CheckState::Errored => "errored",
            CheckState::Skipped => "skipped",
        }
    }

    pub fn all() -> &'static [Self] {
        &[
            CheckState::Pending,
            CheckState::Started,
            CheckState::Succeeded,
            CheckState::Errored,
            CheckState::Skipped,
        ]
    }

    /// Active checks participate in deduplication.
    pub fn is_active(&self) -> bool {
        matches!(self, CheckState::Pending | CheckState::Started)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(&self, next: CheckState) -> bool {
        matches!(
            (self, next),
            (
                CheckState::Pending,
                CheckState::Started | CheckState::Skipped | CheckState::Errored
            ) | (
                CheckState::Started,
                CheckState::Succeeded | CheckState::Errored
            )
        )
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CheckState::Pending),
            "started" => Ok(CheckState::Started),
            "succeeded" => Ok(CheckState::Succeeded),
            "errored" => Ok(CheckState::Errored),
            "skipped" => Ok(CheckState::Skipped),
            other => Err(ModelError::UnknownCheckState(other.to_string())),
        }
    }
}

/// The identity a check deduplicates against.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CheckOwner {
    Resource(ResourceId),
    ResourceType(ResourceTypeId),
    BaseResourceType(BaseResourceTypeId),
}

impl CheckOwner {
    /// Picks the most specific identity given: resource, then resource type,
    /// then the base type fallback.
    pub fn resolve(
        resource_id: Option<ResourceId>,
        resource_type_id: Option<ResourceTypeId>,
        base_resource_type_id: Option<BaseResourceTypeId>,
    ) -> Option<Self> {
        resource_id
            .map(CheckOwner::Resource)
            .or(resource_type_id.map(CheckOwner::ResourceType))
            .or(base_resource_type_id.map(CheckOwner::BaseResourceType))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CheckOwner::Resource(_) => "resource",
            CheckOwner::ResourceType(_) => "resource_type",
            CheckOwner::BaseResourceType(_) => "base_resource_type",
        }
    }

    pub fn raw_id(&self) -> i64 {
        match self {
            CheckOwner::Resource(id) => id.0,
            CheckOwner::ResourceType(id) => id.0,
            CheckOwner::BaseResourceType(id) => id.0,
        }
    }

    pub fn from_parts(kind: &str, id: i64) -> Result<Self, ModelError> {
        match kind {
            "resource" => Ok(CheckOwner::Resource(ResourceId(id))),
            "resource_type" => Ok(CheckOwner::ResourceType(ResourceTypeId(id))),
            "base_resource_type" => {
                Ok(CheckOwner::BaseResourceType(BaseResourceTypeId(id)))
            }
            other => Err(ModelError::UnknownOwnerKind(other.to_string())),
        }
    }
}

impl fmt::Display for CheckOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckOwner::Resource(id) => write!(f, "resource {id}"),
            CheckOwner::ResourceType(id) => write!(f, "resource type {id}"),
            CheckOwner::BaseResourceType(id) => {
                write!(f, "base resource type {id}")
            }
        }
    }
}

/// A unit of scan work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub id: CheckId,
    pub owner: CheckOwner,
    pub resource_id: Option<ResourceId>,
    pub resource_type_id: Option<ResourceTypeId>,
    pub base_resource_type_id: Option<BaseResourceTypeId>,
    pub plan: Plan,
    pub plan_fingerprint: PlanFingerprint,
    pub state: CheckState,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Result of an idempotent check creation.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// A new pending check was inserted.
    Created(Check),
    /// An equivalent active check already existed and is returned instead.
    AlreadyExists(Check),
}

impl CheckOutcome {
    pub fn created(&self) -> bool {
        matches!(self, CheckOutcome::Created(_))
    }

    pub fn check(&self) -> &Check {
        match self {
            CheckOutcome::Created(check)
            | CheckOutcome::AlreadyExists(check) => check,
        }
    }

    pub fn into_check(self) -> Check {
        match self {
            CheckOutcome::Created(check)
            | CheckOutcome::AlreadyExists(check) => check,
        }
    }
}
