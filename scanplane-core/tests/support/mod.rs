#![allow(dead_code)]

use std::sync::Arc;

use scanplane_core::{
    DefaultCheckFactory, InMemoryCheckStore, InMemoryLockBackend,
};
use scanplane_model::{
    BaseResourceType, BaseResourceTypeId, CheckPlan, CheckSubject, PipelineId,
    Plan, PlanStep, Resource, ResourceId, ResourceType, ResourceTypeId, Source,
    TypeImage,
};

pub fn git_resource(id: i64) -> Resource {
    Resource {
        id: ResourceId(id),
        pipeline_id: PipelineId(1),
        name: format!("repo-{id}"),
        type_name: "git".into(),
        source: Source::from_iter([(
            "uri".to_string(),
            serde_json::Value::from(format!(
                "https://example.com/repo-{id}.git"
            )),
        )]),

        tags: Vec::new(),
        pinned_version: None,
        check_timeout_secs: None,
        config_version: 1,
    }
}

pub fn custom_type(id: i64, name: &str, type_name: &str) -> ResourceType {
    ResourceType {
        id: ResourceTypeId(id),
        pipeline_id: PipelineId(1),
        name: name.into(),
        type_name: type_name.into(),
        source: Source::new(),
        tags: Vec::new(),
        privileged: false,
        version: None,
        config_version: 1,
    }
}

/// A check plan for `name` on the git base type.
pub fn git_check_plan(plan_id: &str, name: &str) -> Plan {
    Plan::new(
        plan_id,
        PlanStep::Check(CheckPlan {
            name: name.into(),
            type_name: "git".into(),
            source: Source::new(),
            tags: Vec::new(),
            timeout_secs: None,
            from_version: None,
            type_image: TypeImage::base("git"),
            on_behalf_of: CheckSubject::Resource(name.into()),
        }),
    )
}

/// Store seeded with base type 7 (`git`) and resource 42.
pub async fn seeded_store() -> InMemoryCheckStore {
    let store = InMemoryCheckStore::new();
    store
        .upsert_base_resource_type(BaseResourceType {
            id: BaseResourceTypeId(7),
            name: "git".into(),
        })
        .await;
    store.upsert_resource(git_resource(42)).await;
    store
}

pub fn factory(
    store: &InMemoryCheckStore,
    locks: &InMemoryLockBackend,
) -> Arc<DefaultCheckFactory> {
    Arc::new(DefaultCheckFactory::new(
        Arc::new(store.clone()),
        Arc::new(locks.clone()),
    ))
}
