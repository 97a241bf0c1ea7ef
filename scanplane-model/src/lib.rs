//! Core data model definitions shared across Scanplane crates.
#![allow(missing_docs)]

pub mod check;
pub mod error;
pub mod ids;
pub mod plan;
pub mod resource;

pub use check::{Check, CheckOutcome, CheckOwner, CheckState};
pub use error::{ModelError, PlanError};
pub use ids::{
    BaseResourceTypeId, CheckId, PipelineId, PlanId, ResourceId,
    ResourceTypeId,
};
pub use plan::{
    CheckPlan, CheckSubject, GetPlan, MAX_PLAN_DEPTH, Plan, PlanFingerprint,
    PlanStep, TypeImage,
};

pub use resource::{BaseResourceType, Resource, ResourceType, Source, Version};
