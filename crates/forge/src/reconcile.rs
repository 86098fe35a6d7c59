//! Reconciliation loop.
//!
//! Webhooks and callbacks can be lost, and the process can die halfway
//! through a flow. On a fixed interval the reconciler loads every job with
//! outstanding work from the store and drives it forward: it re-runs stale
//! allocations, polls pods whose last update is older than the staleness
//! threshold, enforces timeouts, finishes claimed completions (including
//! deferred artifact collection) and settles teardown and refund obligations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;
use crate::model::{JobId, JobRecord, JobStatus};
use crate::orchestrator::Orchestrator;

/// What happened to one job during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileResult {
    /// The job's state moved forward.
    Advanced,
    /// Checked, nothing to do.
    Unchanged,
    /// A recent provider update made a poll unnecessary.
    Skipped,
    /// Some step failed; it will be retried next pass.
    Failed { reason: String },
}

/// Report from a reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// When the pass ran.
    pub run_time: DateTime<Utc>,
    /// Jobs with outstanding work.
    pub checked: usize,
    pub advanced: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Errors by job.
    pub errors: Vec<ReconcileError>,
}

/// A step that failed for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileError {
    pub job_id: JobId,
    pub reason: String,
}

/// Periodically re-verifies in-flight jobs.
pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
}

impl Reconciler {
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Run passes until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.orchestrator.config().reconcile.interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Reconciler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once(Utc::now()).await {
                        Ok(report) if report.checked > 0 => info!(
                            checked = report.checked,
                            advanced = report.advanced,
                            skipped = report.skipped,
                            failed = report.failed,
                            "Reconciliation pass complete"
                        ),
                        Ok(_) => debug!("Reconciliation pass found nothing in flight"),
                        Err(e) => warn!(error = %e, "Reconciliation pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Run one pass over every in-flight job.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport, OrchestratorError> {
        let records = self.orchestrator.store().list_in_flight().await?;
        let concurrency = self.orchestrator.config().reconcile.concurrency.max(1);

        let mut report = ReconcileReport {
            run_time: now,
            checked: records.len(),
            ..ReconcileReport::default()
        };

        let results: Vec<(JobId, ReconcileResult)> = stream::iter(records)
            .map(|record| async move {
                let job_id = record.job.id;
                (job_id, self.reconcile_job(record, now).await)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (job_id, result) in results {
            match result {
                ReconcileResult::Advanced => report.advanced += 1,
                ReconcileResult::Unchanged => report.unchanged += 1,
                ReconcileResult::Skipped => report.skipped += 1,
                ReconcileResult::Failed { reason } => {
                    warn!(job_id = %job_id, reason = %reason, "Reconciliation step failed");
                    report.failed += 1;
                    report.errors.push(ReconcileError { job_id, reason });
                }
            }
        }
        Ok(report)
    }

    /// Drive one job forward.
    pub async fn reconcile_job(&self, record: JobRecord, now: DateTime<Utc>) -> ReconcileResult {
        let job_id = record.job.id;
        let before = record.job.version;

        let mut outcome = match self.advance(&record, now).await {
            Ok(outcome) => outcome,
            Err(e) => ReconcileResult::Failed {
                reason: e.to_string(),
            },
        };

        if let Err(e) = self.settle_refunds(job_id, now).await {
            outcome = ReconcileResult::Failed {
                reason: format!("refund: {e}"),
            };
        }

        if outcome == ReconcileResult::Unchanged {
            let after = self
                .orchestrator
                .store()
                .get(job_id)
                .await
                .map_or(before, |r| r.job.version);
            if after != before {
                outcome = ReconcileResult::Advanced;
            }
        }
        outcome
    }

    async fn advance(
        &self,
        record: &JobRecord,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, OrchestratorError> {
        let orchestrator = &self.orchestrator;
        let job = &record.job;
        let job_id = job.id;

        if job.status.is_terminal() {
            if job.teardown_pending {
                orchestrator.retry_teardown(job_id, now).await?;
            }
            return Ok(ReconcileResult::Unchanged);
        }

        // Also covers a deferred artifact collection: the pod is kept until it succeeds.
        if job.completion_claimed.is_some() {
            orchestrator.finish_completion(job_id, now).await?;
            return Ok(ReconcileResult::Unchanged);
        }

        if job.status == JobStatus::Provisioning && job.pod_reference.is_none() {
            if orchestrator.enforce_timeouts(job_id, now).await?.is_some() {
                return Ok(ReconcileResult::Advanced);
            }
            debug!(job_id = %job_id, "Re-running allocation");
            orchestrator.provision(job_id, now).await?;
            return Ok(ReconcileResult::Unchanged);
        }

        let threshold = chrono::Duration::from_std(orchestrator.config().policy.staleness_threshold)
            .unwrap_or_else(|_| chrono::Duration::zero());
        if job
            .last_provider_update
            .is_some_and(|at| now - at < threshold)
        {
            debug!(job_id = %job_id, "Recent provider update, skipping poll");
            return Ok(ReconcileResult::Skipped);
        }

        if let Err(e) = orchestrator.refresh(job_id, now).await {
            // Fall through to the timeouts; an unreachable provider is what they are for.
            warn!(job_id = %job_id, error = %e, "Pod poll failed");
            if orchestrator.enforce_timeouts(job_id, now).await?.is_some() {
                return Ok(ReconcileResult::Advanced);
            }
            return Err(e);
        }

        orchestrator.enforce_timeouts(job_id, now).await?;
        Ok(ReconcileResult::Unchanged)
    }

    async fn settle_refunds(&self, job_id: JobId, now: DateTime<Utc>) -> Result<usize, OrchestratorError> {
        let record = self.orchestrator.store().get(job_id).await?;
        if !record.has_queued_refund() {
            return Ok(0);
        }
        self.orchestrator.process_refund(job_id, now).await
    }
}
