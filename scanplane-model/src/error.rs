use std::fmt::{self, Display};

use crate::ids::PlanId;

/// Errors produced by model constructors and validation routines.
#[derive(Debug)]
pub enum ModelError {
    Serialization(serde_json::Error),
    InvalidPlan(PlanError),
    UnknownCheckState(String),
    UnknownOwnerKind(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Serialization(err) => {
                write!(f, "serialization error: {err}")
            }
            ModelError::InvalidPlan(err) => write!(f, "invalid plan: {err}"),
            ModelError::UnknownCheckState(raw) => {
                write!(f, "unknown check state '{raw}'")
            }
            ModelError::UnknownOwnerKind(raw) => {
                write!(f, "unknown check owner kind '{raw}'")
            }
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModelError::Serialization(err) => Some(err),
            ModelError::InvalidPlan(err) => Some(err),
            ModelError::UnknownCheckState(_)
            | ModelError::UnknownOwnerKind(_) => None,
        }
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Serialization(err)
    }
}

impl From<PlanError> for ModelError {
    fn from(err: PlanError) -> Self {
        ModelError::InvalidPlan(err)
    }
}

/// Reasons a scan plan is rejected before any check is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    EmptyPlanId,
    EmptySequence { plan_id: PlanId },
    MissingName { plan_id: PlanId },
    MissingType { plan_id: PlanId },
    DuplicatePlanId { plan_id: PlanId },
    UnresolvedTypeImage { plan_id: PlanId },
    TooDeep { plan_id: PlanId, depth: usize },
}

impl Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::EmptyPlanId => write!(f, "plan has an empty id"),
            PlanError::EmptySequence { plan_id } => {
                write!(f, "plan {plan_id} has an empty step sequence")
            }
            PlanError::MissingName { plan_id } => {
                write!(f, "plan {plan_id} step has no name")
            }
            PlanError::MissingType { plan_id } => {
                write!(f, "plan {plan_id} step has no resource type")
            }
            PlanError::DuplicatePlanId { plan_id } => {
                write!(f, "plan id {plan_id} appears more than once")
            }
            PlanError::UnresolvedTypeImage { plan_id } => write!(
                f,
                "plan {plan_id} type image names neither a base type \
                 nor a get plan"
            ),
            PlanError::TooDeep { plan_id, depth } => write!(
                f,
                "plan {plan_id} nests {depth} levels deep; \
                 the resource type chain cannot be resolved"

            ),
        }
    }
}

impl std::error::Error for PlanError {}
