mod support;

use std::collections::HashSet;

use futures::future::join_all;
use scanplane_core::{
    CheckFactory, CheckRequest, CheckStore, InMemoryCheckStore,
    InMemoryLockBackend, ScanError,
};
use scanplane_model::{
    BaseResourceTypeId, CheckOwner, CheckState, ResourceId, ResourceTypeId,
};

use support::{custom_type, factory, git_check_plan, git_resource, seeded_store};

fn request_for_42(plan_id: &str) -> CheckRequest {
    CheckRequest::for_resource(
        ResourceId(42),
        git_check_plan(plan_id, "repo-42"),
    )
    .with_base_resource_type(BaseResourceTypeId(7))
}

#[tokio::test]
async fn back_to_back_requests_collapse_into_one_check() {
    let store = seeded_store().await;
    let factory = factory(&store, &InMemoryLockBackend::new());

    let first = factory.create_check(request_for_42("p1")).await.unwrap();
    let second = factory.create_check(request_for_42("p1")).await.unwrap();

    assert!(first.created());
    assert!(!second.created());
    assert_eq!(first.check().id, second.check().id);
    assert_eq!(first.check().state, CheckState::Pending);
    assert_eq!(first.check().owner, CheckOwner::Resource(ResourceId(42)));
    assert_eq!(store.check_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_requests_create_exactly_one_check() {
    let store = seeded_store().await;
    let factory = factory(&store, &InMemoryLockBackend::new());

    let outcomes = join_all((0..16).map(|_| {
        let factory = factory.clone();
        tokio::spawn(
            async move { factory.create_check(request_for_42("p1")).await },
        )
    }))
    .await;

    let outcomes: Vec<_> = outcomes
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    assert_eq!(outcomes.iter().filter(|outcome| outcome.created()).count(), 1);

    let ids: HashSet<_> =
        outcomes.iter().map(|outcome| outcome.check().id).collect();

    assert_eq!(ids.len(), 1);
    assert_eq!(store.check_count().await, 1);
}

#[tokio::test]
async fn different_plans_for_the_same_owner_are_distinct() {
    let store = seeded_store().await;
    let factory = factory(&store, &InMemoryLockBackend::new());

    let first = factory.create_check(request_for_42("p1")).await.unwrap();
    let second = factory.create_check(request_for_42("p2")).await.unwrap();

    assert!(first.created());
    assert!(second.created());
    assert_ne!(first.check().id, second.check().id);
}

#[tokio::test]
async fn terminal_check_does_not_block_a_new_one() {
    let store = seeded_store().await;
    let factory = factory(&store, &InMemoryLockBackend::new());

    let first = factory
        .create_check(request_for_42("p1"))
        .await
        .unwrap()
        .into_check();
    store
        .transition_check(first.id, CheckState::Started)
        .await
        .unwrap();
    store
        .transition_check(first.id, CheckState::Succeeded)
        .await
        .unwrap();

    let next = factory.create_check(request_for_42("p1")).await.unwrap();

    assert!(next.created());
    assert_ne!(next.check().id, first.id);
}

#[tokio::test]
async fn started_check_still_deduplicates() {
    let store = seeded_store().await;
    let factory = factory(&store, &InMemoryLockBackend::new());

    let first = factory
        .create_check(request_for_42("p1"))
        .await
        .unwrap()
        .into_check();
    store
        .transition_check(first.id, CheckState::Started)
        .await
        .unwrap();

    let again = factory.create_check(request_for_42("p1")).await.unwrap();
    assert!(!again.created());
    assert_eq!(again.check().state, CheckState::Started);
}

#[tokio::test]
async fn started_checks_track_transitions() {
    let store = seeded_store().await;
    let factory = factory(&store, &InMemoryLockBackend::new());

    let check = factory
        .create_check(request_for_42("p1"))
        .await
        .unwrap()
        .into_check();
    assert!(factory.started_checks().await.unwrap().is_empty());

    store
        .transition_check(check.id, CheckState::Started)
        .await
        .unwrap();
    let started = factory.started_checks().await.unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].id, check.id);
    assert!(started[0].start_time.is_some());

    store
        .transition_check(check.id, CheckState::Errored)
        .await
        .unwrap();
    assert!(factory.started_checks().await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_store_reads_return_empty_lists() {
    let store = InMemoryCheckStore::new();
    let factory = factory(&store, &InMemoryLockBackend::new());

    assert!(factory.resource_types().await.unwrap().is_empty());
    assert!(factory.resources().await.unwrap().is_empty());
    assert!(factory.base_resource_types().await.unwrap().is_empty());
    assert!(factory.started_checks().await.unwrap().is_empty());
}

#[tokio::test]
async fn listings_reflect_configuration() {
    let store = seeded_store().await;
    store.upsert_resource(git_resource(43)).await;
    store
        .upsert_resource_type(custom_type(3, "mirror", "git"))
        .await;
    let factory = factory(&store, &InMemoryLockBackend::new());

    let resources = factory.resources().await.unwrap();
    assert_eq!(
        resources.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![ResourceId(42), ResourceId(43)]
    );
    let types = factory.resource_types().await.unwrap();
    assert_eq!(types[0].id, ResourceTypeId(3));
}

#[tokio::test]
async fn fallback_owner_is_the_resource_type_then_the_base_type() {
    let store = seeded_store().await;
    store
        .upsert_resource_type(custom_type(3, "mirror", "git"))
        .await;
    let factory = factory(&store, &InMemoryLockBackend::new());

    let type_check = factory
        .create_check(
            CheckRequest::for_resource_type(
                ResourceTypeId(3),
                git_check_plan("t1", "mirror"),
            )
            .with_base_resource_type(BaseResourceTypeId(7)),
        )
        .await
        .unwrap();
    assert_eq!(
        type_check.check().owner,
        CheckOwner::ResourceType(ResourceTypeId(3))
    );

    let base_check = factory
        .create_check(CheckRequest {
            resource_id: None,
            resource_type_id: None,
            base_resource_type_id: Some(BaseResourceTypeId(7)),
            plan: git_check_plan("b1", "git"),
        })
        .await
        .unwrap();
    assert_eq!(
        base_check.check().owner,
        CheckOwner::BaseResourceType(BaseResourceTypeId(7))
    );
}

#[tokio::test]
async fn unknown_resource_is_rejected_without_inserting() {
    let store = seeded_store().await;
    let factory = factory(&store, &InMemoryLockBackend::new());

    let err = factory
        .create_check(CheckRequest::for_resource(
            ResourceId(999),
            git_check_plan("p1", "ghost"),
        ))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ScanError::UnknownOwner(CheckOwner::Resource(ResourceId(999)))
    ));
    assert_eq!(store.check_count().await, 0);
}

#[tokio::test]
async fn malformed_plan_is_rejected_without_inserting() {
    let store = seeded_store().await;
    let factory = factory(&store, &InMemoryLockBackend::new());

    let err = factory
        .create_check(CheckRequest::for_resource(
            ResourceId(42),
            git_check_plan("", "repo-42"),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::InvalidPlan { .. }));
    assert!(!err.is_retryable());
    assert_eq!(store.check_count().await, 0);
}

#[tokio::test]
async fn create_check_does_not_need_the_scanning_lock() {
    let store = seeded_store().await;
    let locks = InMemoryLockBackend::new();
    let factory = factory(&store, &locks);

    let _held = factory.acquire_scanning_lock().await.unwrap();
    let outcome = factory.create_check(request_for_42("p1")).await.unwrap();

    assert!(outcome.created());
}

#[tokio::test]
async fn resource_removed_from_configuration_is_unknown() {
    let store = seeded_store().await;
    let factory = factory(&store, &InMemoryLockBackend::new());
    assert!(
        factory
            .create_check(request_for_42("p1"))
            .await
            .unwrap()
            .created()
    );

    store.remove_resource(ResourceId(42)).await;
    let err = factory
        .create_check(request_for_42("p2"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ScanError::UnknownOwner(CheckOwner::Resource(ResourceId(42)))
    ));
    assert_eq!(store.check_count().await, 1);
}
