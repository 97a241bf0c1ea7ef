//! Call recording for code that consumes a [`CheckFactory`].
//!
//! Wrap any factory in a [`RecordingCheckFactory`] and hand it a [`CallLog`];
//! every call is appended to that log before being delegated. Each test owns
//! its log, so nothing leaks between tests.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use scanplane_model::{
    BaseResourceType, Check, CheckOutcome, PipelineId, Resource, ResourceType,
};
use tokio::sync::Mutex;

use crate::{
    error::Result,
    factory::{CheckFactory, CheckRequest},
    lock::LockAttempt,
};

/// One recorded factory call with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    AcquireScanningLock,
    AcquirePipelineScanningLock(PipelineId),
    CreateCheck(CheckRequest),
    ResourceTypes,
    Resources,
    BaseResourceTypes,
    StartedChecks,
}

impl Call {
    /// Operation name, for count assertions.
    pub fn operation(&self) -> &'static str {
        match self {
            Call::AcquireScanningLock => "acquire_scanning_lock",
            Call::AcquirePipelineScanningLock(_) => {
                "acquire_pipeline_scanning_lock"
            }
            Call::CreateCheck(_) => "create_check",
            Call::ResourceTypes => "resource_types",
            Call::Resources => "resources",
            Call::BaseResourceTypes => "base_resource_types",
            Call::StartedChecks => "started_checks",
        }
    }
}

/// Ordered, shareable record of factory calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, call: Call) {
        self.calls.lock().await.push(call);
    }

    /// Snapshot of every call so far, in order.
    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    pub async fn count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.operation() == operation)
            .count()
    }

    /// Arguments of every `create_check` call, in order.
    pub async fn created_requests(&self) -> Vec<CheckRequest> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                Call::CreateCheck(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn clear(&self) {
        self.calls.lock().await.clear();
    }
}

/// Delegating factory that records each call into a [`CallLog`].
pub struct RecordingCheckFactory {
    inner: Arc<dyn CheckFactory>,
    log: CallLog,
}

impl fmt::Debug for RecordingCheckFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingCheckFactory")
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

impl RecordingCheckFactory {
    pub fn new(inner: Arc<dyn CheckFactory>, log: CallLog) -> Self {
        Self { inner, log }
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }
}

#[async_trait]
impl CheckFactory for RecordingCheckFactory {
    async fn acquire_scanning_lock(&self) -> Result<LockAttempt> {
        self.log.record(Call::AcquireScanningLock).await;
        self.inner.acquire_scanning_lock().await
    }

    async fn acquire_pipeline_scanning_lock(
        &self,
        pipeline_id: PipelineId,
    ) -> Result<LockAttempt> {
        self.log
            .record(Call::AcquirePipelineScanningLock(pipeline_id))
            .await;
        self.inner.acquire_pipeline_scanning_lock(pipeline_id).await
    }

    async fn create_check(
        &self,
        request: CheckRequest,
    ) -> Result<CheckOutcome> {

        self.log.record(Call::CreateCheck(request.clone())).await;
        self.inner.create_check(request).await
    }

    async fn resource_types(&self) -> Result<Vec<ResourceType>> {
        self.log.record(Call::ResourceTypes).await;
        self.inner.resource_types().await
    }

    async fn resources(&self) -> Result<Vec<Resource>> {
        self.log.record(Call::Resources).await;
        self.inner.resources().await
    }

    async fn base_resource_types(&self) -> Result<Vec<BaseResourceType>> {
        self.log.record(Call::BaseResourceTypes).await;
        self.inner.base_resource_types().await
    }

    async fn started_checks(&self) -> Result<Vec<Check>> {
        self.log.record(Call::StartedChecks).await;
        self.inner.started_checks().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        factory::DefaultCheckFactory,
        lock::InMemoryLockBackend,
        store::InMemoryCheckStore,
    };

    fn recording(log: &CallLog) -> RecordingCheckFactory {
        let inner = DefaultCheckFactory::new(
            Arc::new(InMemoryCheckStore::new()),
            Arc::new(InMemoryLockBackend::new()),
        );
        RecordingCheckFactory::new(Arc::new(inner), log.clone())
    }

    #[tokio::test]
    async fn records_calls_in_order_with_arguments() {
        let log = CallLog::new();
        let factory = recording(&log);

        factory.acquire_pipeline_scanning_lock(PipelineId(3)).await.unwrap();
        factory.resources().await.unwrap();
        factory.started_checks().await.unwrap();

        assert_eq!(
            log.calls().await,
            vec![
                Call::AcquirePipelineScanningLock(PipelineId(3)),
                Call::Resources,
                Call::StartedChecks,
            ]
        );
    }

    #[tokio::test]
    async fn logs_are_independent_per_test() {
        let first = CallLog::new();
        let second = CallLog::new();

        recording(&first).resource_types().await.unwrap();

        assert_eq!(first.count("resource_types").await, 1);
        assert_eq!(second.count("resource_types").await, 0);
    }

    #[tokio::test]
    async fn failed_calls_are_still_recorded() {
        let log = CallLog::new();
        let factory = recording(&log);
        let request = CheckRequest {
            resource_id: None,
            resource_type_id: None,
            base_resource_type_id: None,
            plan: scanplane_model::Plan::new(
                "orphan",
                scanplane_model::PlanStep::Do(Vec::new()),
            ),
        };

        assert!(factory.create_check(request.clone()).await.is_err());
        assert_eq!(log.created_requests().await, vec![request]);

        log.clear().await;
        assert!(log.calls().await.is_empty());
    }
}
