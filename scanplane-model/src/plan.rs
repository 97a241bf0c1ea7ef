//! Fully resolved scan plans.
//!
//! A plan is a small step graph. For a resource backed by a custom resource
//! type the check step carries a [`TypeImage`] whose nested plans first check
//! and fetch the type's image, recursively, until a base type is reached.

use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{ModelError, PlanError},
    ids::PlanId,
    resource::{Source, Version},
};

/// Upper bound on nesting; anything deeper is treated as an unresolvable type
/// chain.
pub const MAX_PLAN_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub step: PlanStep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "config", rename_all = "snake_case")]
pub enum PlanStep {
    Check(CheckPlan),
    Get(GetPlan),
    Do(Vec<Plan>),
}

/// Whose versions a check step records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSubject {
    Resource(String),
    ResourceType(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPlan {
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub from_version: Option<Version>,
    pub type_image: TypeImage,
    pub on_behalf_of: CheckSubject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPlan {
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: Option<Version>,
    pub type_image: TypeImage,
}

/// How the worker obtains the image that runs a step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TypeImage {
    /// Set when the step runs directly on a base resource type.
    #[serde(default)]
    pub base_type: Option<String>,
    /// Check of the custom type's own image, run on behalf of that type.
    #[serde(default)]
    pub check_plan: Option<Box<Plan>>,
    /// Fetch of the custom type's image at its pinned version.
    #[serde(default)]
    pub get_plan: Option<Box<Plan>>,
    #[serde(default)]
    pub privileged: bool,
}

impl TypeImage {
    pub fn base(name: impl Into<String>) -> Self {
        Self {
            base_type: Some(name.into()),
            ..Self::default()
        }
    }
}

/// SHA-256 digest (hex) of a plan's canonical JSON.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PlanFingerprint(pub String);

impl PlanFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Plan {
    pub fn new(id: impl Into<PlanId>, step: PlanStep) -> Self {
        Self {
            id: id.into(),
            step,
        }
    }

    /// Rejects plans the executor could not run: empty ids or sequences,
    /// unnamed/untyped steps, duplicate ids and unresolvable type chains.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        self.validate_at(0, &mut seen)
    }

    fn validate_at<'a>(
        &'a self,
        depth: usize,
        seen: &mut HashSet<&'a PlanId>,
    ) -> Result<(), PlanError> {
        if self.id.as_str().trim().is_empty() {
            return Err(PlanError::EmptyPlanId);
        }
        if depth >= MAX_PLAN_DEPTH {
            return Err(PlanError::TooDeep {
                plan_id: self.id.clone(),
                depth,
            });
        }
        if !seen.insert(&self.id) {
            return Err(PlanError::DuplicatePlanId {
                plan_id: self.id.clone(),
            });
        }

        match &self.step {
            PlanStep::Check(check) => {
                self.require_named(&check.name, &check.type_name)?;
                self.validate_type_image(&check.type_image, depth, seen)
            }
            PlanStep::Get(get) => {
                self.require_named(&get.name, &get.type_name)?;
                self.validate_type_image(&get.type_image, depth, seen)
            }
            PlanStep::Do(steps) => {
                if steps.is_empty() {
                    return Err(PlanError::EmptySequence {
                        plan_id: self.id.clone(),
                    });
                }
                steps
                    .iter()
                    .try_for_each(|step| step.validate_at(depth + 1, seen))
            }
        }
    }

    fn require_named(
        &self,
        name: &str,
        type_name: &str,
    ) -> Result<(), PlanError> {

        if name.trim().is_empty() {
            return Err(PlanError::MissingName {
                plan_id: self.id.clone(),
            });
        }
        if type_name.trim().is_empty() {
            return Err(PlanError::MissingType {
                plan_id: self.id.clone(),
            });
        }
        Ok(())
    }

    fn validate_type_image<'a>(
        &'a self,
        image: &'a TypeImage,
        depth: usize,
        seen: &mut HashSet<&'a PlanId>,
    ) -> Result<(), PlanError> {
        let has_base = image
            .base_type
            .as_deref()
            .is_some_and(|name| !name.trim().is_empty());
        if !has_base && image.get_plan.is_none() {
            return Err(PlanError::UnresolvedTypeImage {
                plan_id: self.id.clone(),
            });
        }
        if let Some(check) = &image.check_plan {
            check.validate_at(depth + 1, seen)?;
        }
        if let Some(get) = &image.get_plan {
            get.validate_at(depth + 1, seen)?;
        }
        Ok(())
    }

    /// Stable digest used as the deduplication key alongside the check owner.
    pub fn fingerprint(&self) -> Result<PlanFingerprint, ModelError> {
        let canonical = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&canonical);
        Ok(PlanFingerprint(hex::encode(digest)))
    }

    /// Number of nested levels, counting this plan as one.
    pub fn depth(&self) -> usize {
        let nested = match &self.step {
            PlanStep::Check(check) => check.type_image.depth(),
            PlanStep::Get(get) => get.type_image.depth(),
            PlanStep::Do(steps) => {
                steps.iter().map(Plan::depth).max().unwrap_or(0)
            }
        };
        1 + nested
    }
}

impl TypeImage {
    fn depth(&self) -> usize {
        let check = self.check_plan.as_ref().map_or(0, |plan| plan.depth());
        let get = self.get_plan.as_ref().map_or(0, |plan| plan.depth());
        check.max(get)
    }
}
