mod support;

use futures::future::join_all;
use scanplane_core::{
    CheckFactory, InMemoryCheckStore, InMemoryLockBackend, LockBackend,
    LockScope,

};
use scanplane_model::PipelineId;

use support::factory;

#[tokio::test]
async fn second_attempt_sees_held_until_release() {
    let locks = InMemoryLockBackend::new();
    let factory = factory(&InMemoryCheckStore::new(), &locks);

    let first = factory.acquire_scanning_lock().await.unwrap();
    let second = factory.acquire_scanning_lock().await.unwrap();
    assert!(first.acquired());
    assert!(!second.acquired());

    let lock = first.into_lock().unwrap();
    lock.release().await.unwrap();

    let third = factory.acquire_scanning_lock().await.unwrap();
    assert!(third.acquired());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attempts_have_exactly_one_winner() {
    let locks = InMemoryLockBackend::new();
    let factory = factory(&InMemoryCheckStore::new(), &locks);

    let attempts = join_all((0..8).map(|_| {
        let factory = factory.clone();
        tokio::spawn(async move { factory.acquire_scanning_lock().await })
    }))
    .await;

    let attempts: Vec<_> = attempts
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    assert_eq!(attempts.iter().filter(|a| a.acquired()).count(), 1);
}

#[tokio::test]
async fn release_is_idempotent() {
    let locks = InMemoryLockBackend::new();
    let lock = locks
        .try_acquire(LockScope::Global)
        .await
        .unwrap()
        .into_lock()
        .unwrap();

    lock.release().await.unwrap();
    lock.release().await.unwrap();

    assert!(!locks.is_held(LockScope::Global));
}

#[tokio::test]
async fn second_release_does_not_free_a_new_holder() {
    let locks = InMemoryLockBackend::new();
    let stale = locks
        .try_acquire(LockScope::Global)
        .await
        .unwrap()
        .into_lock()
        .unwrap();
    stale.release().await.unwrap();

    let current = locks.try_acquire(LockScope::Global).await.unwrap();
    assert!(current.acquired());

    stale.release().await.unwrap();
    assert!(locks.is_held(LockScope::Global));
}

#[tokio::test]
async fn dropping_an_unreleased_lock_frees_the_scope() {
    let locks = InMemoryLockBackend::new();
    {
        let attempt = locks.try_acquire(LockScope::Global).await.unwrap();
        assert!(attempt.acquired());
    }

    assert!(!locks.is_held(LockScope::Global));
    assert!(locks.try_acquire(LockScope::Global).await.unwrap().acquired());
}

#[tokio::test]
async fn severed_holder_releases_cleanly() {
    let locks = InMemoryLockBackend::new();
    let lock = locks
        .try_acquire(LockScope::Global)
        .await
        .unwrap()
        .into_lock()
        .unwrap();

    assert!(locks.sever(LockScope::Global));
    assert!(locks.try_acquire(LockScope::Global).await.unwrap().acquired());
    lock.release().await.unwrap();
}

#[tokio::test]
async fn pipeline_scopes_are_independent() {
    let locks = InMemoryLockBackend::new();
    let factory = factory(&InMemoryCheckStore::new(), &locks);

    let global = factory.acquire_scanning_lock().await.unwrap();
    let one = factory
        .acquire_pipeline_scanning_lock(PipelineId(1))
        .await
        .unwrap();
    let two = factory
        .acquire_pipeline_scanning_lock(PipelineId(2))
        .await
        .unwrap();
    let one_again = factory
        .acquire_pipeline_scanning_lock(PipelineId(1))
        .await
        .unwrap();

    assert!(global.acquired());
    assert!(one.acquired());
    assert!(two.acquired());
    assert!(!one_again.acquired());
}
