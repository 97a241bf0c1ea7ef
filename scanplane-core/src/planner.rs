//! Builds fully resolved check plans from pipeline configuration.
//!
//! A resource whose type is a custom resource type gets a check step whose
//! type image checks and fetches that type first, recursively, until a base
//! resource type is reached. Plan ids are derived from the owner so repeated
//! planning of unchanged configuration yields identical plans.

use std::collections::HashSet;

use scanplane_model::{
    BaseResourceType, BaseResourceTypeId, CheckPlan, CheckSubject, GetPlan,
    MAX_PLAN_DEPTH, PipelineId, Plan, PlanId, PlanStep, Resource, ResourceType,
    ResourceTypeId, TypeImage,
};
use thiserror::Error;

use crate::factory::CheckRequest;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlannerError {
    #[error(
        "{subject} uses unknown resource type '{type_name}' in pipeline \
         {pipeline_id}"
    )]
    UnknownType {
        subject: String,
        type_name: String,
        pipeline_id: PipelineId,
    },

    #[error(
        "{subject} in pipeline {pipeline_id} nests custom resource types \
         deeper than {limit} levels"
    )]
    ChainTooDeep {
        subject: String,
        pipeline_id: PipelineId,
        limit: usize,
    },
}

#[derive(Debug)]
enum Unresolved {
    UnknownType(String),
    TooDeep,
}

impl Unresolved {
    fn into_planner_error(
        self,
        subject: String,
        pipeline_id: PipelineId,
    ) -> PlannerError {
        match self {
            Unresolved::UnknownType(type_name) => PlannerError::UnknownType {
                subject,
                type_name,
                pipeline_id,
            },
            Unresolved::TooDeep => PlannerError::ChainTooDeep {
                subject,
                pipeline_id,
                limit: MAX_PLAN_DEPTH,
            },
        }
    }
}

#[derive(Debug)]
struct ResolvedImage {
    image: TypeImage,
    resource_type_id: Option<ResourceTypeId>,
    base_resource_type_id: BaseResourceTypeId,
}

/// Snapshot of the configuration a scanning cycle plans against.
#[derive(Debug, Clone, Copy)]
pub struct CheckPlanner<'a> {
    resource_types: &'a [ResourceType],
    base_types: &'a [BaseResourceType],
}

impl<'a> CheckPlanner<'a> {
    pub fn new(
        resource_types: &'a [ResourceType],
        base_types: &'a [BaseResourceType],
    ) -> Self {
        Self {
            resource_types,
            base_types,
        }
    }

    pub fn plan_for_resource(
        &self,
        resource: &Resource,
    ) -> Result<CheckRequest, PlannerError> {
        let plan_id = PlanId::new(format!("resource-{}", resource.id));
        let mut visiting = HashSet::new();
        let resolved = self
            .resolve_image(
                &resource.type_name,
                resource.pipeline_id,
                &plan_id,
                1,
                &mut visiting,
            )
            .map_err(|err| {
                err.into_planner_error(
                    format!("resource '{}'", resource.name),
                    resource.pipeline_id,
                )
            })?;

        let plan = Plan::new(
            plan_id,
            PlanStep::Check(CheckPlan {
                name: resource.name.clone(),
                type_name: resource.type_name.clone(),
                source: resource.source.clone(),
                tags: resource.tags.clone(),
                timeout_secs: resource.check_timeout_secs,
                from_version: resource.pinned_version.clone(),
                type_image: resolved.image,
                on_behalf_of: CheckSubject::Resource(resource.name.clone()),
            }),
        );

        Ok(CheckRequest {
            resource_id: Some(resource.id),
            resource_type_id: resolved.resource_type_id,
            base_resource_type_id: Some(resolved.base_resource_type_id),
            plan,
        })
    }

    pub fn plan_for_resource_type(
        &self,
        resource_type: &ResourceType,
    ) -> Result<CheckRequest, PlannerError> {
        let plan_id =
            PlanId::new(format!("resource-type-{}", resource_type.id));
        let mut visiting = HashSet::from([resource_type.name.clone()]);
        let resolved = self
            .resolve_image(
                &resource_type.type_name,
                resource_type.pipeline_id,
                &plan_id,
                1,
                &mut visiting,
            )
            .map_err(|err| {
                err.into_planner_error(
                    format!("resource type '{}'", resource_type.name),
                    resource_type.pipeline_id,
                )
            })?;

        let plan = Plan::new(
            plan_id,
            PlanStep::Check(
                self.type_check_plan(resource_type, resolved.image),
            ),
        );

        Ok(CheckRequest {
            resource_id: None,
            resource_type_id: Some(resource_type.id),
            base_resource_type_id: Some(resolved.base_resource_type_id),
            plan,
        })
    }

    fn type_check_plan(
        &self,
        resource_type: &ResourceType,
        image: TypeImage,
    ) -> CheckPlan {
        CheckPlan {
            name: resource_type.name.clone(),
            type_name: resource_type.type_name.clone(),
            source: resource_type.source.clone(),
            tags: resource_type.tags.clone(),
            timeout_secs: None,
            from_version: resource_type.version.clone(),
            type_image: image,
            on_behalf_of: CheckSubject::ResourceType(
                resource_type.name.clone(),
            ),
        }
    }

    fn custom_type(
        &self,
        name: &str,
        pipeline_id: PipelineId,
        visiting: &HashSet<String>,
    ) -> Option<&'a ResourceType> {
        self.resource_types.iter().find(|candidate| {
            candidate.pipeline_id == pipeline_id
                && candidate.name == name
                && !visiting.contains(candidate.name.as_str())
        })
    }

    /// Resolves the image for `type_name`. A custom type shadows a base type of
    /// the same name, except while resolving that custom type's own parent.
    ///
    /// `depth` is the nesting level the image plans would occupy. Every custom
    /// type doubles the plan size, so the chain is cut off before it could
    /// exceed [`MAX_PLAN_DEPTH`] rather than after building it.
    fn resolve_image(
        &self,
        type_name: &str,
        pipeline_id: PipelineId,
        parent: &PlanId,
        depth: usize,
        visiting: &mut HashSet<String>,
    ) -> Result<ResolvedImage, Unresolved> {
        let Some(custom) = self.custom_type(type_name, pipeline_id, visiting)
        else {
            return self
                .base_types
                .iter()
                .find(|base| base.name == type_name)
                .map(|base| ResolvedImage {
                    image: TypeImage::base(base.name.clone()),
                    resource_type_id: None,
                    base_resource_type_id: base.id,
                })
                .ok_or_else(|| Unresolved::UnknownType(type_name.to_string()));
        };

        if depth >= MAX_PLAN_DEPTH {
            return Err(Unresolved::TooDeep);
        }

        visiting.insert(custom.name.clone());
        let check_id = parent.child("image-check");
        let get_id = parent.child("image-get");
        let parents = self
            .resolve_image(
                &custom.type_name,
                pipeline_id,
                &check_id,
                depth + 1,
                visiting,
            )
            .and_then(|check_parent| {
                let get_parent = self.resolve_image(
                    &custom.type_name,
                    pipeline_id,
                    &get_id,
                    depth + 1,
                    visiting,
                )?;
                Ok((check_parent, get_parent))
            });
        visiting.remove(custom.name.as_str());
        let (check_parent, get_parent) = parents?;

        let image = TypeImage {
            base_type: None,
            check_plan: Some(Box::new(Plan::new(
                check_id,
                PlanStep::Check(
                    self.type_check_plan(custom, check_parent.image),
                ),
            ))),
            get_plan: Some(Box::new(Plan::new(
                get_id,
                PlanStep::Get(GetPlan {
                    name: custom.name.clone(),
                    type_name: custom.type_name.clone(),
                    source: custom.source.clone(),
                    tags: custom.tags.clone(),
                    version: custom.version.clone(),
                    type_image: get_parent.image,
                }),
            ))),
            privileged: custom.privileged,
        };

        Ok(ResolvedImage {
            image,
            resource_type_id: Some(custom.id),
            base_resource_type_id: check_parent.base_resource_type_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanplane_model::{ResourceId, Source, Version};

    fn base_types() -> Vec<BaseResourceType> {
        vec![
            BaseResourceType {
                id: BaseResourceTypeId(7),
                name: "git".into(),
            },
            BaseResourceType {
                id: BaseResourceTypeId(8),
                name: "registry-image".into(),
            },
        ]
    }

    fn resource(type_name: &str) -> Resource {
        Resource {
            id: ResourceId(42),
            pipeline_id: PipelineId(1),
            name: "repo".into(),
            type_name: type_name.into(),
            source: Source::new(),
            tags: Vec::new(),
            pinned_version: None,
            check_timeout_secs: Some(60),
            config_version: 1,
        }
    }

    fn custom(id: i64, name: &str, type_name: &str) -> ResourceType {
        ResourceType {
            id: ResourceTypeId(id),
            pipeline_id: PipelineId(1),
            name: name.into(),
            type_name: type_name.into(),
            source: Source::new(),
            tags: Vec::new(),
            privileged: false,
            version: Some(Version::from([(
                "digest".to_string(),
                format!("sha256:{id}"),
            )])),
            config_version: 1,
        }
    }

    #[test]
    fn base_typed_resource_checks_directly() {
        let bases = base_types();
        let planner = CheckPlanner::new(&[], &bases);

        let request = planner.plan_for_resource(&resource("git")).unwrap();

        assert_eq!(request.resource_id, Some(ResourceId(42)));
        assert_eq!(request.resource_type_id, None);
        assert_eq!(request.base_resource_type_id, Some(BaseResourceTypeId(7)));
        assert!(request.plan.validate().is_ok());
        let PlanStep::Check(check) = &request.plan.step else {
            panic!("expected check step");
        };
        assert_eq!(check.type_image.base_type.as_deref(), Some("git"));
        assert_eq!(check.timeout_secs, Some(60));
    }

    #[test]
    fn custom_type_chain_resolves_to_base() {
        let bases = base_types();
        let types = vec![
            custom(3, "slack", "oci"),
            custom(4, "oci", "registry-image"),
        ];
        let planner = CheckPlanner::new(&types, &bases);

        let request = planner.plan_for_resource(&resource("slack")).unwrap();

        assert_eq!(request.resource_type_id, Some(ResourceTypeId(3)));
        assert_eq!(request.base_resource_type_id, Some(BaseResourceTypeId(8)));
        assert_eq!(request.plan.depth(), 3);
        assert!(request.plan.validate().is_ok(), "nested ids stay unique");

        let PlanStep::Check(check) = &request.plan.step else {
            panic!("expected check step");
        };
        let image_check = check.type_image.check_plan.as_ref().unwrap();
        let PlanStep::Check(type_check) = &image_check.step else {
            panic!("expected nested check");
        };
        assert_eq!(
            type_check.on_behalf_of,
            CheckSubject::ResourceType("slack".into())
        );
        assert_eq!(
            type_check.from_version,
            Some(Version::from([(
                "digest".to_string(),
                "sha256:3".to_string()
            )]))

        );
    }

    #[test]
    fn custom_type_may_shadow_a_base_type_name() {
        let bases = base_types();
        let types = vec![custom(5, "git", "git")];
        let planner = CheckPlanner::new(&types, &bases);

        let request = planner.plan_for_resource(&resource("git")).unwrap();

        assert_eq!(request.resource_type_id, Some(ResourceTypeId(5)));
        assert_eq!(request.base_resource_type_id, Some(BaseResourceTypeId(7)));
    }

    #[test]
    fn unknown_type_is_reported() {
        let bases = base_types();
        let planner = CheckPlanner::new(&[], &bases);

        let err = planner.plan_for_resource(&resource("s3")).unwrap_err();
        assert_eq!(
            err,
            PlannerError::UnknownType {
                subject: "resource 'repo'".into(),
                type_name: "s3".into(),
                pipeline_id: PipelineId(1),
            }
        );
    }

    #[test]
    fn types_from_other_pipelines_are_ignored() {
        let bases = base_types();
        let mut other = custom(3, "slack", "registry-image");
        other.pipeline_id = PipelineId(2);
        let types = vec![other];
        let planner = CheckPlanner::new(&types, &bases);

        assert!(planner.plan_for_resource(&resource("slack")).is_err());
    }

    #[test]
    fn resource_type_plan_checks_on_its_own_behalf() {
        let bases = base_types();
        let types = vec![custom(3, "slack", "registry-image")];
        let planner = CheckPlanner::new(&types, &bases);

        let request = planner.plan_for_resource_type(&types[0]).unwrap();

        assert_eq!(request.resource_id, None);
        assert_eq!(request.resource_type_id, Some(ResourceTypeId(3)));
        assert_eq!(request.base_resource_type_id, Some(BaseResourceTypeId(8)));
        assert_eq!(request.plan.id, PlanId::new("resource-type-3"));
    }

    /// `t0 -> t1 -> ... -> t{len-1} -> git`
    fn chain(len: usize) -> Vec<ResourceType> {
        (0..len)
            .map(|level| {
                let parent = if level + 1 == len {
                    "git".to_string()
                } else {
                    format!("t{}", level + 1)
                };
                custom(100 + level as i64, &format!("t{level}"), &parent)
            })
            .collect()
    }

    #[test]
    fn longest_allowed_chain_validates() {
        let bases = base_types();
        let types = chain(MAX_PLAN_DEPTH - 1);
        let planner = CheckPlanner::new(&types, &bases);

        let request = planner.plan_for_resource(&resource("t0")).unwrap();

        assert_eq!(request.plan.depth(), MAX_PLAN_DEPTH);
        assert!(request.plan.validate().is_ok());
        assert_eq!(request.base_resource_type_id, Some(BaseResourceTypeId(7)));
    }

    #[test]
    fn overlong_chain_is_rejected_before_it_is_built() {
        let bases = base_types();
        let types = chain(20);
        let planner = CheckPlanner::new(&types, &bases);

        let err = planner.plan_for_resource(&resource("t0")).unwrap_err();
        assert_eq!(
            err,
            PlannerError::ChainTooDeep {
                subject: "resource 'repo'".into(),
                pipeline_id: PipelineId(1),
                limit: MAX_PLAN_DEPTH,
            }
        );

        let err = planner.plan_for_resource_type(&types[0]).unwrap_err();
        assert!(matches!(err, PlannerError::ChainTooDeep { .. }));
    }

    #[test]
    fn chain_one_past_the_limit_is_rejected() {
        let bases = base_types();
        let types = chain(MAX_PLAN_DEPTH);
        let planner = CheckPlanner::new(&types, &bases);

        assert!(matches!(
            planner.plan_for_resource(&resource("t0")),
            Err(PlannerError::ChainTooDeep { .. })
        ));
    }
}
