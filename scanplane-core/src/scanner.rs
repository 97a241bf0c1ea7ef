//! Periodic scanner driving the check factory.
//!
//! Each cycle tries the scanning lock once. The winner plans a check for every
//! resource type and resource in scope and submits them; everyone else waits
//! for the next tick.

use std::{fmt, sync::Arc};

use chrono::Utc;
use futures::{StreamExt, stream};
use scanplane_model::{Check, CheckOutcome, PipelineId};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::ScannerConfig,
    error::Result,
    factory::{CheckFactory, CheckRequest},
    planner::CheckPlanner,
};

/// What one scanning cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Another process held the scanning lock; nothing was scheduled.
    pub lock_held_elsewhere: bool,
    pub created: usize,
    pub already_active: usize,
    /// Items skipped because of configuration or validation errors.
    pub failed: usize,
}

impl ScanSummary {
    fn lock_held_elsewhere() -> Self {
        Self {
            lock_held_elsewhere: true,
            ..Self::default()
        }
    }

    pub fn scheduled(&self) -> usize {
        self.created + self.already_active
    }
}

pub struct Scanner {
    factory: Arc<dyn CheckFactory>,
    config: ScannerConfig,
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scanner {
    pub fn new(factory: Arc<dyn CheckFactory>, config: ScannerConfig) -> Self {
        Self { factory, config }
    }

    /// Runs one scanning cycle. Infrastructure failures abort the cycle and are
    /// returned; per-item validation failures are logged and counted.
    #[instrument(
        name = "scanner.tick",
        skip(self),
        fields(scope = %self.config.lock_scope()),
        err
    )]
    pub async fn tick(&self) -> Result<ScanSummary> {
        let attempt = match self.config.pipeline_id {
            Some(pipeline_id) => {
                self.factory
                    .acquire_pipeline_scanning_lock(pipeline_id)
                    .await?
            }
            None => self.factory.acquire_scanning_lock().await?,
        };

        let Some(lock) = attempt.into_lock() else {
            debug!("scanning lock held by another scanner");
            return Ok(ScanSummary::lock_held_elsewhere());
        };

        let result = self.schedule().await;

        if let Err(err) = lock.release().await {
            warn!(error = %err, "failed to release scanning lock");
        }

        result
    }

    async fn schedule(&self) -> Result<ScanSummary> {
        let base_types = self.factory.base_resource_types().await?;
        let resource_types = self.factory.resource_types().await?;
        let resources = self.factory.resources().await?;

        let in_scope = |pipeline_id: PipelineId| {
            self.config
                .pipeline_id
                .is_none_or(|scoped| scoped == pipeline_id)
        };

        let planner = CheckPlanner::new(&resource_types, &base_types);
        let mut summary = ScanSummary::default();
        let mut requests: Vec<CheckRequest> = Vec::new();

        let planned = resource_types
            .iter()
            .filter(|resource_type| in_scope(resource_type.pipeline_id))
            .map(|resource_type| planner.plan_for_resource_type(resource_type))
            .chain(
                resources
                    .iter()
                    .filter(|resource| in_scope(resource.pipeline_id))
                    .map(|resource| planner.plan_for_resource(resource)),
            );
        for plan in planned {
            match plan {
                Ok(request) => requests.push(request),
                Err(err) => {
                    warn!(error = %err, "skipping unplannable check");
                    summary.failed += 1;
                }
            }
        }

        let factory = &self.factory;
        let mut outcomes = stream::iter(requests)
            .map(move |request| async move {
                let owner = request.owner();
                (owner, factory.create_check(request).await)
            })
            .buffer_unordered(self.config.create_concurrency.max(1));

        while let Some((owner, outcome)) = outcomes.next().await {
            match outcome {
                Ok(CheckOutcome::Created(_)) => summary.created += 1,
                Ok(CheckOutcome::AlreadyExists(_)) => {
                    summary.already_active += 1
                }
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(owner = ?owner, error = %err, "check rejected");
                    summary.failed += 1;
                }
            }
        }

        info!(
            created = summary.created,
            already_active = summary.already_active,
            failed = summary.failed,
            "scanning cycle finished"
        );
        Ok(summary)
    }

    /// Started checks that have been running longer than the configured
    /// threshold.
    pub async fn report_stuck_checks(&self) -> Result<Vec<Check>> {
        let threshold = self.config.stuck_check_after();
        let now = Utc::now();

        let stuck: Vec<Check> = self
            .factory
            .started_checks()
            .await?
            .into_iter()
            .filter(|check| {
                check.start_time.is_some_and(|started| {
                    now.signed_duration_since(started) > threshold
                })
            })
            .collect();

        for check in &stuck {
            warn!(
                check_id = %check.id,
                owner = %check.owner,
                start_time = ?check.start_time,
                "check appears stuck"
            );
        }
        Ok(stuck)
    }

    /// Polls until `shutdown` fires. Errors are logged and retried on the next
    /// tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = self.config.interval_ms,
            scope = %self.config.lock_scope(),
            "scanner started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(err) = self.tick().await {
                warn!(
                    error = %err,
                    retryable = err.is_retryable(),
                    "scanning cycle failed"
                );
            }
            if let Err(err) = self.report_stuck_checks().await {
                warn!(error = %err, "stuck check report failed");
            }
        }

        info!("scanner stopped");
    }
}
