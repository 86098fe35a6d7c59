//! Job orchestrator.
//!
//! Owns every state change of a training job. User commands, payment
//! webhooks, pod callbacks and reconciliation polls all end up in the same
//! [`Orchestrator::commit`] primitive, which validates the transition against
//! the state machine and writes through the store's compare-and-swap.
//!
//! ```text
//! draft ──► pending_payment ──► provisioning ──► running ──► completed
//!   │             │                  │              │
//!   └─► cancelled ◄┘                  └──► failed ◄──┘
//! ```
//!
//! Internal handlers re-read and retry a bounded number of times when they
//! lose a race; user commands surface [`OrchestratorError::StaleStateConflict`].

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use forge_gpu::{GpuProvider, PodHandle, PodStatus};
use forge_payments::{Amount, Currency, ParsedEvent, PaymentEventKind, PaymentGateway};
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactSource, ArtifactStore};
use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::model::{
    ArtifactReference, FailureReason, JobId, JobRecord, JobStatus, JobView, OrderStatus, OwnerId,
    PaymentOrder, Refund, RefundStatus, TrainingJob,
};
use crate::pricing::Pricing;
use crate::store::{JobStore, Precondition};
use crate::training::{self, SubmitJob};

/// Result of applying a payment webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// The event changed the job or its orders.
    Processed {
        job_id: JobId,
        /// The job is now paid and waiting for a pod.
        provision: bool,
    },
    /// The event id was already applied.
    Duplicate,
    /// The event does not concern any known job or is not acted upon.
    Ignored,
}

/// Result of an allocation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// A new pod was allocated.
    Allocated(PodHandle),
    /// A pod from an earlier, interrupted attempt was adopted.
    Recovered(PodHandle),
    /// No GPU type could be allocated; the job failed.
    Exhausted(FailureReason),
    /// The job does not need a pod or another allocator holds the claim.
    Skipped,
}

/// Coordinates jobs across the store, the GPU provider and the payment gateway.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    provider: Arc<dyn GpuProvider>,
    gateway: Arc<dyn PaymentGateway>,
    artifacts: Arc<dyn ArtifactStore>,
    config: Arc<Config>,
    pricing: Pricing,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn GpuProvider>,
        gateway: Arc<dyn PaymentGateway>,
        artifacts: Arc<dyn ArtifactStore>,
        config: Arc<Config>,
    ) -> Self {
        let pricing = Pricing::new(config.pricing.clone());
        Self {
            store,
            provider,
            gateway,
            artifacts,
            config,
            pricing,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    // ========================================================================
    // Transition primitive
    // ========================================================================

    /// Commit `next` if the stored record still matches `current`.
    ///
    /// Rejects transitions the state machine forbids and records that would
    /// break an invariant. A lost race yields `StaleStateConflict`.
    async fn commit(&self, current: &JobRecord, next: JobRecord) -> Result<JobRecord> {
        let from = current.job.status;
        let to = next.job.status;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition { from, to });
        }
        next.check_invariants()
            .map_err(OrchestratorError::Invariant)?;

        let committed = self
            .store
            .compare_and_swap(Precondition::of(current), next)
            .await?;

        if from != to {
            info!(
                job_id = %committed.job.id,
                from = %from,
                to = %to,
                version = committed.job.version,
                "Job transitioned"
            );
        }
        Ok(committed)
    }

    /// Run `op` on a fresh read, retrying on lost races.
    async fn with_conflict_retry<T, F, Fut>(&self, job_id: JobId, mut op: F) -> Result<T>
    where
        F: FnMut(JobRecord) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let record = self.store.get(job_id).await?;
            match op(record).await {
                Err(e) if e.is_conflict() && attempt < self.config.policy.conflict_retries => {
                    attempt += 1;
                    debug!(job_id = %job_id, attempt, "Stale write, retrying with fresh state");
                }
                result => return result,
            }
        }
    }

    /// Fetch a record on behalf of its owner. Other owners see nothing.
    async fn owned(&self, job_id: JobId, owner: &OwnerId) -> Result<JobRecord> {
        let record = self.store.get(job_id).await?;
        if &record.job.owner != owner {
            return Err(OrchestratorError::NotFound(job_id));
        }
        Ok(record)
    }

    // ========================================================================
    // Submission and payment
    // ========================================================================

    /// Validate and price a request, create the job and its payment intent.
    ///
    /// If the intent cannot be created the job stays in `draft` and the error
    /// is returned; [`Orchestrator::renew_payment`] can try again.
    pub async fn submit(
        &self,
        owner: OwnerId,
        request: SubmitJob,
        now: DateTime<Utc>,
    ) -> Result<JobView> {
        let config = request.into_config(&self.config.training)?;
        let estimate = self.pricing.quote(&config.model_type, config.image_count)?;
        let mut job = TrainingJob::draft(owner, config, estimate, now);
        job.log(
            now,
            format!(
                "submitted: {} model, {} images, {}",
                job.config.model_type, job.config.image_count, estimate.charge
            ),
        );
        let record = JobRecord::new(job);
        self.store.insert(record.clone()).await?;

        info!(
            job_id = %record.job.id,
            owner = %record.job.owner,
            model_type = %record.job.config.model_type,
            charge = %estimate.charge,
            payment_reference = %record.job.payment_reference,
            "Job submitted"
        );

        let record = self.open_order(record, now).await?;
        Ok(JobView::from(&record))
    }

    /// Create a fresh payment intent for a job that has none usable.
    pub async fn renew_payment(
        &self,
        job_id: JobId,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> Result<JobView> {
        let record = self.owned(job_id, owner).await?;
        let order_status = record.order.as_ref().map(|o| o.status);

        let record = match (record.job.status, order_status) {
            (JobStatus::Draft, _) | (JobStatus::PendingPayment, Some(OrderStatus::Failed)) => {
                self.open_order(record, now).await?
            }
            (JobStatus::PendingPayment, _) => record,
            (from, _) => {
                return Err(OrchestratorError::InvalidTransition {
                    from,
                    to: JobStatus::PendingPayment,
                })
            }
        };
        Ok(JobView::from(&record))
    }

    /// Create an intent and attach it as the current order, superseding a failed one.
    async fn open_order(&self, record: JobRecord, now: DateTime<Utc>) -> Result<JobRecord> {
        let job_id = record.job.id;
        let mut order = PaymentOrder::new(job_id, record.job.cost_estimate.charge, now);

        let intent = match self
            .gateway
            .create_intent(order.amount, &job_id.to_string(), &order.intent_key())
            .await
        {
            Ok(intent) => intent,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to create payment intent");
                let mut next = record.clone();
                next.job.last_error = Some(format!("payment intent: {e}"));
                next.job.log(now, format!("payment intent not created: {e}"));
                if let Err(err) = self.commit(&record, next).await {
                    debug!(job_id = %job_id, error = %err, "Could not record intent failure");
                }
                return Err(e.into());
            }
        };

        order.intent_id = Some(intent.intent_id.clone());
        order.client_secret = intent.client_secret;

        let mut next = record.clone();
        if let Some(previous) = next.order.take() {
            info!(job_id = %job_id, order_id = %previous.id, "Superseding payment order");
            next.superseded_orders.push(previous);
        }
        next.order = Some(order);
        next.job.status = JobStatus::PendingPayment;
        next.job.last_error = None;
        next.job.log(now, format!("awaiting payment on intent {}", intent.intent_id));

        let committed = self.commit(&record, next).await?;
        info!(job_id = %job_id, intent_id = %intent.intent_id, "Payment intent attached");
        Ok(committed)
    }

    /// Apply a verified payment event. Idempotent by event id.
    pub async fn handle_payment_event(
        &self,
        event: &ParsedEvent,
        now: DateTime<Utc>,
    ) -> Result<PaymentOutcome> {
        let Some(intent_id) = event.intent_id.as_deref() else {
            debug!(event_id = %event.id, kind = %event.kind, "Event without payment intent");
            return Ok(PaymentOutcome::Ignored);
        };
        let Some(record) = self.store.find_by_intent(intent_id).await? else {
            warn!(event_id = %event.id, intent_id = %intent_id, "Event for unknown intent");
            return Ok(PaymentOutcome::Ignored);
        };

        self.with_conflict_retry(record.job.id, |record| {
            self.apply_payment_event(record, event, intent_id, now)
        })
        .await
    }

    async fn apply_payment_event(
        &self,
        record: JobRecord,
        event: &ParsedEvent,
        intent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentOutcome> {
        let job_id = record.job.id;
        let is_current = record
            .order
            .as_ref()
            .is_some_and(|o| o.intent_id.as_deref() == Some(intent_id));

        let mut next = record.clone();
        let job_status = next.job.status;
        let order = next
            .order_for_intent_mut(intent_id)
            .ok_or(OrchestratorError::Invariant("intent lookup returned a foreign record"))?;

        if !order.provider_event_ids.insert(event.id.clone()) {
            debug!(job_id = %job_id, event_id = %event.id, "Duplicate payment event");
            return Ok(PaymentOutcome::Duplicate);
        }

        let mut provision = false;
        let mut start_provisioning = false;
        let mut cancel_job = false;
        let mut note = None;
        match &event.kind {
            PaymentEventKind::IntentSucceeded => match order.status {
                OrderStatus::Created | OrderStatus::Failed => {
                    order.status = OrderStatus::Confirmed;
                    order.confirmed_at = Some(now);
                    if !is_current {
                        warn!(job_id = %job_id, intent_id = %intent_id, "Superseded order was paid, refunding");
                        order.queue_refund(order.amount, "superseded order paid", now);
                        note = Some(format!("superseded intent {intent_id} paid, refund queued"));
                    } else if job_status == JobStatus::PendingPayment {
                        start_provisioning = true;
                        provision = true;
                        note = Some(format!("payment of {} confirmed", order.amount));
                    } else {
                        warn!(job_id = %job_id, status = %job_status, "Payment arrived for inactive job, refunding");
                        order.queue_refund(order.amount, "paid after cancellation", now);
                        note = Some("paid after cancellation, refund queued".to_string());
                    }
                }
                OrderStatus::Confirmed | OrderStatus::Refunded => {
                    debug!(job_id = %job_id, "Order already confirmed");
                }
            },
            PaymentEventKind::IntentPaymentFailed => {
                if order.status == OrderStatus::Created {
                    order.status = OrderStatus::Failed;
                    cancel_job = is_current && job_status == JobStatus::PendingPayment;
                    note = Some(format!("payment failed on intent {intent_id}"));
                }
            }
            PaymentEventKind::IntentCanceled => {
                if order.status == OrderStatus::Created {
                    order.status = OrderStatus::Failed;
                    note = Some(format!("intent {intent_id} canceled"));
                }
            }
            PaymentEventKind::ChargeRefunded => {
                let paid = matches!(order.status, OrderStatus::Confirmed | OrderStatus::Refunded);
                let Some(minor) = event.amount.filter(|_| paid) else {
                    warn!(
                        job_id = %job_id,
                        event_id = %event.id,
                        order_status = %order.status,
                        amount = ?event.amount,
                        "Refund event does not apply to this order, recording only"
                    );
                    self.commit(&record, next).await?;
                    return Ok(PaymentOutcome::Ignored);
                };
                let refunded = Amount {
                    minor: minor.min(order.amount.minor),
                    currency: order.amount.currency,
                };
                if minor >= order.amount.minor {
                    order.status = OrderStatus::Refunded;
                }
                match order.refund.as_mut() {
                    Some(refund) if refunded.minor >= refund.amount.minor => {
                        refund.status = RefundStatus::Issued;
                    }
                    Some(refund) => {
                        warn!(
                            job_id = %job_id,
                            owed = %refund.amount,
                            refunded = %refunded,
                            "Provider refunded less than owed, keeping refund queued"
                        );
                    }
                    None => {
                        order.refund = Some(Refund {
                            amount: refunded,
                            status: RefundStatus::Issued,
                            reason: "refunded by provider".to_string(),
                            provider_refund_id: None,
                            requested_at: now,
                        });
                    }
                }
                note = Some(format!("provider reports {refunded} refunded"));
            }
            PaymentEventKind::Other(kind) => {
                debug!(job_id = %job_id, kind = %kind, "Recording unhandled payment event");
                self.commit(&record, next).await?;
                return Ok(PaymentOutcome::Ignored);
            }
        }

        if start_provisioning {
            next.job.status = JobStatus::Provisioning;
            next.job.deadline_at = Some(now + to_delta(self.config.policy.payment_deadline));
            next.job.last_error = None;
        }
        if cancel_job {
            next.job.status = JobStatus::Cancelled;
            next.job.finished_at = Some(now);
            next.job.last_error = Some("payment failed".to_string());
        }
        if let Some(note) = note {
            next.job.log(now, note);
        }

        self.commit(&record, next).await?;
        info!(job_id = %job_id, event_id = %event.id, kind = %event.kind, "Payment event applied");
        Ok(PaymentOutcome::Processed { job_id, provision })
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Allocate a pod for a paid job.
    ///
    /// The claim on `allocating_since` keeps concurrent allocators apart. A pod
    /// left over from an interrupted attempt is found by name and adopted.
    pub async fn provision(&self, job_id: JobId, now: DateTime<Utc>) -> Result<ProvisionOutcome> {
        let Some(claimed) = self
            .with_conflict_retry(job_id, |record| self.claim_allocation(record, now))
            .await?
        else {
            return Ok(ProvisionOutcome::Skipped);
        };
        let claim = claimed.job.allocating_since;
        let name = training::pod_name(job_id);

        match self.provider.find_by_name(&name).await {
            Ok(Some(pod)) => {
                info!(job_id = %job_id, pod_id = %pod.id, "Adopting existing pod");
                return self
                    .attach_pod(job_id, claim, pod, now)
                    .await
                    .map(|attached| attached.map_or(ProvisionOutcome::Skipped, ProvisionOutcome::Recovered));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Pod lookup failed, releasing claim");
                self.release_claim(job_id, claim).await;
                return Err(e.into());
            }
        }

        let spec = training::pod_spec(
            job_id,
            &claimed.job.config,
            &self.config.callback_url(&job_id.to_string()),
        );
        let mut capacity_failures = 0usize;
        let mut other_failures = 0usize;

        for gpu_type in &claimed.job.config.gpu_preferences {
            match self.provider.allocate(gpu_type, &spec).await {
                Ok(pod) => {
                    info!(job_id = %job_id, pod_id = %pod.id, gpu_type = %gpu_type, "Pod allocated");
                    return self
                        .attach_pod(job_id, claim, pod, now)
                        .await
                        .map(|attached| attached.map_or(ProvisionOutcome::Skipped, ProvisionOutcome::Allocated));
                }
                Err(e) if e.is_capacity() => {
                    capacity_failures += 1;
                    warn!(job_id = %job_id, gpu_type = %gpu_type, error = %e, "No capacity, trying next GPU type");
                }
                Err(e) => {
                    other_failures += 1;
                    warn!(job_id = %job_id, gpu_type = %gpu_type, error = %e, "Allocation failed");
                    // A deploy can land even when its response is lost.
                    match self.provider.find_by_name(&name).await {
                        Ok(Some(pod)) => {
                            info!(job_id = %job_id, pod_id = %pod.id, "Failed allocation left a pod, adopting it");
                            return self
                                .attach_pod(job_id, claim, pod, now)
                                .await
                                .map(|attached| attached.map_or(ProvisionOutcome::Skipped, ProvisionOutcome::Recovered));
                        }
                        Ok(None) => {}
                        Err(lookup) => {
                            warn!(job_id = %job_id, error = %lookup, "Pod lookup failed, releasing claim");
                            self.release_claim(job_id, claim).await;
                            return Err(lookup.into());
                        }
                    }
                }
            }
        }

        let reason = if other_failures == 0 {
            FailureReason::NoCapacity
        } else {
            FailureReason::AllocationFailed
        };
        warn!(
            job_id = %job_id,
            capacity_failures,
            other_failures,
            reason = %reason,
            "Every GPU type failed"
        );

        let failed = self
            .with_conflict_retry(job_id, |record| async move {
                if record.job.status != JobStatus::Provisioning
                    || record.job.pod_reference.is_some()
                    || record.job.allocating_since != claim
                {
                    return Ok(false);
                }
                self.fail_from(record, reason, now).await.map(|_| true)
            })
            .await?;

        Ok(if failed {
            ProvisionOutcome::Exhausted(reason)
        } else {
            ProvisionOutcome::Skipped
        })
    }

    /// Whether a record is waiting for a pod and free to be claimed.
    ///
    /// A claim stays valid for as long as its allocator could still be
    /// working through the job's GPU preferences.
    fn needs_allocation(&self, record: &JobRecord, now: DateTime<Utc>) -> bool {
        let job = &record.job;
        let ttl = self
            .config
            .allocation_claim_ttl(job.config.gpu_preferences.len());
        job.status == JobStatus::Provisioning
            && job.pod_reference.is_none()
            && job.completion_claimed.is_none()
            && job
                .allocating_since
                .is_none_or(|since| now - since >= to_delta(ttl))
    }

    async fn claim_allocation(
        &self,
        record: JobRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        if !self.needs_allocation(&record, now) {
            debug!(job_id = %record.job.id, status = %record.job.status, "No allocation needed");
            return Ok(None);
        }
        let mut next = record.clone();
        next.job.allocating_since = Some(now);
        self.commit(&record, next).await.map(Some)
    }

    async fn release_claim(&self, job_id: JobId, claim: Option<DateTime<Utc>>) {
        let result = self
            .with_conflict_retry(job_id, |record| async move {
                if record.job.allocating_since != claim {
                    return Ok(());
                }
                let mut next = record.clone();
                next.job.allocating_since = None;
                self.commit(&record, next).await.map(|_| ())
            })
            .await;
        if let Err(e) = result {
            warn!(job_id = %job_id, error = %e, "Failed to release allocation claim");
        }
    }

    /// Record an allocated pod, or terminate it if the job moved on meanwhile.
    ///
    /// A pod the job already references is never terminated here: another
    /// allocator adopted it by name.
    async fn attach_pod(
        &self,
        job_id: JobId,
        claim: Option<DateTime<Utc>>,
        pod: PodHandle,
        now: DateTime<Utc>,
    ) -> Result<Option<PodHandle>> {
        let attached = self
            .with_conflict_retry(job_id, |record| {
                let pod = pod.clone();
                async move {
                    let job = &record.job;
                    if job.pod_reference.as_ref() == Some(&pod) {
                        debug!(job_id = %job_id, pod_id = %pod.id, "Pod already attached by another allocator");
                        return Ok(true);
                    }
                    if job.status != JobStatus::Provisioning
                        || job.pod_reference.is_some()
                        || job.allocating_since != claim
                    {
                        return Ok(false);
                    }
                    let mut next = record.clone();
                    next.job.pod_reference = Some(pod.clone());
                    next.job.provisioned_at = Some(now);
                    next.job.allocating_since = None;
                    next.job.last_seen_at = Some(now);
                    next.job.last_provider_update = Some(now);
                    next.job.log(now, format!("pod {} attached ({})", pod.id, pod.gpu_type));
                    self.commit(&record, next).await.map(|_| true)
                }
            })
            .await?;

        if attached {
            return Ok(Some(pod));
        }

        warn!(job_id = %job_id, pod_id = %pod.id, "Job changed during allocation, terminating pod");
        if let Err(e) = self.provider.terminate(&pod).await {
            warn!(job_id = %job_id, pod_id = %pod.id, error = %e, "Failed to terminate unneeded pod");
            self.park_pod(job_id, &pod, &e.to_string(), now).await;
            return Err(OrchestratorError::Teardown {
                pod_id: pod.id,
                message: e.to_string(),
            });
        }
        Ok(None)
    }

    /// Hand a pod that could not be terminated to reconciliation by recording
    /// it on a finished job with teardown pending.
    async fn park_pod(&self, job_id: JobId, pod: &PodHandle, error: &str, now: DateTime<Utc>) {
        let result = self
            .with_conflict_retry(job_id, |record| async move {
                if !record.job.status.is_terminal() || record.job.pod_reference.is_some() {
                    return Ok(false);
                }
                let mut next = record.clone();
                next.job.pod_reference = Some(pod.clone());
                next.job.teardown_pending = true;
                next.job.last_error = Some(format!("teardown: {error}"));
                next.job.log(now, format!("late pod {} left running, teardown pending", pod.id));
                self.commit(&record, next).await.map(|_| true)
            })
            .await;
        match result {
            Ok(true) => info!(job_id = %job_id, pod_id = %pod.id, "Late pod handed to reconciliation"),
            Ok(false) => warn!(job_id = %job_id, pod_id = %pod.id, "Late pod could not be recorded"),
            Err(e) => warn!(job_id = %job_id, pod_id = %pod.id, error = %e, "Failed to record late pod"),
        }
    }

    // ========================================================================
    // Pod status
    // ========================================================================

    /// Feed a provider observation into the job.
    ///
    /// Used by pod callbacks and reconciliation polls alike. Observations for
    /// terminal jobs, jobs without a pod, or another pod are ignored.
    pub async fn apply_pod_status(
        &self,
        job_id: JobId,
        pod_id: Option<&str>,
        status: PodStatus,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        self.with_conflict_retry(job_id, |record| {
            self.apply_status_to(record, pod_id, status, now)
        })
        .await
    }

    async fn apply_status_to(
        &self,
        record: JobRecord,
        pod_id: Option<&str>,
        status: PodStatus,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let job_id = record.job.id;
        if record.job.status.is_terminal() {
            debug!(job_id = %job_id, pod_status = %status, "Ignoring status for finished job");
            return Ok(record);
        }
        let Some(pod) = record.job.pod_reference.clone() else {
            debug!(job_id = %job_id, pod_status = %status, "Ignoring status, no pod attached");
            return Ok(record);
        };
        if let Some(reported) = pod_id {
            if reported != pod.id {
                warn!(job_id = %job_id, pod_id = %reported, expected = %pod.id, "Status for unknown pod");
                return Ok(record);
            }
        }

        match status {
            PodStatus::Starting => {
                let mut next = record.clone();
                next.job.last_seen_at = Some(now);
                self.commit(&record, next).await
            }
            PodStatus::Running => {
                let mut next = record.clone();
                next.job.last_seen_at = Some(now);
                if record.job.status == JobStatus::Provisioning {
                    next.job.status = JobStatus::Running;
                    next.job.running_since = Some(now);
                    next.job.last_provider_update = Some(now);
                    next.job.log(now, "training started");
                }
                self.commit(&record, next).await
            }
            PodStatus::Completed => self.complete(record, pod, now).await,
            PodStatus::Errored if record.job.completion_claimed.is_some() => {
                self.finish_completion_of(record, now).await
            }
            PodStatus::Errored => self.fail_from(record, FailureReason::PodError, now).await,
            PodStatus::Unknown => Ok(record),
        }
    }

    /// Poll the provider for a job's pod and apply the answer.
    pub async fn refresh(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord> {
        let record = self.store.get(job_id).await?;
        let Some(pod) = record.job.pod_reference.clone() else {
            return Ok(record);
        };
        let status = self.provider.poll_status(&pod).await?;
        debug!(job_id = %job_id, pod_id = %pod.id, pod_status = %status, "Polled pod");
        self.apply_pod_status(job_id, Some(&pod.id), status, now)
            .await
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Claim completion, then persist the artifact and tear the pod down.
    async fn complete(
        &self,
        record: JobRecord,
        pod: PodHandle,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let claimed = if record.job.completion_claimed.is_some() {
            record
        } else {
            let mut next = record.clone();
            next.job.completion_claimed = Some(now);
            next.job.teardown_pending = true;
            next.job.last_seen_at = Some(now);
            next.job.last_provider_update = Some(now);
            next.job.log(now, "training finished, collecting artifact");
            let claimed = self.commit(&record, next).await?;
            info!(job_id = %claimed.job.id, pod_id = %pod.id, "Training finished, finalizing");
            claimed
        };
        self.finish_completion_of(claimed, now).await
    }

    /// Resume a claimed completion.
    pub async fn finish_completion(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord> {
        self.with_conflict_retry(job_id, |record| async move {
            if record.job.completion_claimed.is_none() || record.job.status.is_terminal() {
                return Ok(record);
            }
            self.finish_completion_of(record, now).await
        })
        .await
    }

    async fn finish_completion_of(&self, record: JobRecord, now: DateTime<Utc>) -> Result<JobRecord> {
        let job_id = record.job.id;
        let Some(pod) = record.job.pod_reference.clone() else {
            return Err(OrchestratorError::Invariant("claimed completion without a pod"));
        };
        let collected_at = record.job.completion_claimed.unwrap_or(now);

        // The weights live on the pod, so they are fetched before it is torn down.
        let (artifact, artifact_error) = match self.collect_artifact(job_id, &pod, collected_at).await {
            Ok(reference) => (Some(reference), None),
            Err(e) => {
                let attempts = record.job.artifact_attempts.saturating_add(1);
                if attempts < self.config.policy.artifact_attempts {
                    warn!(job_id = %job_id, attempts, error = %e, "Artifact not collected, keeping pod for another attempt");
                    let mut next = record.clone();
                    next.job.artifact_attempts = attempts;
                    next.job.artifact_pending = true;
                    next.job.last_error = Some(format!("artifact: {e}"));
                    next.job.log(now, format!("artifact collection failed (attempt {attempts}): {e}"));
                    return self.commit(&record, next).await;
                }
                warn!(job_id = %job_id, attempts, error = %e, "Artifact collection failed, completing without it");
                (None, Some((attempts, e.to_string())))
            }
        };

        if let Err(e) = self.provider.terminate(&pod).await {
            warn!(job_id = %job_id, pod_id = %pod.id, error = %e, "Teardown failed, will retry");
            let mut next = record.clone();
            next.job.last_error = Some(format!("teardown: {e}"));
            next.job.log(now, format!("teardown of pod {} failed: {e}", pod.id));
            if let Err(err) = self.commit(&record, next).await {
                debug!(job_id = %job_id, error = %err, "Could not record teardown failure");
            }
            return Err(OrchestratorError::Teardown {
                pod_id: pod.id,
                message: e.to_string(),
            });
        }

        let charge = record
            .order
            .as_ref()
            .map_or(record.job.cost_estimate.charge, |o| o.amount);

        let mut next = record.clone();
        next.job.status = JobStatus::Completed;
        next.job.completed_at = Some(now);
        next.job.finished_at = Some(now);
        next.job.cost_actual = Some(self.pricing.costs(charge));
        next.job.released_pod = next.job.pod_reference.take();
        next.job.teardown_pending = false;
        next.job.artifact_pending = false;
        match (&artifact, artifact_error) {
            (Some(reference), _) => {
                next.job.last_error = None;
                next.job.log(now, format!("completed, artifact stored at {}", reference.uri));
            }
            (None, Some((attempts, error))) => {
                next.job.artifact_attempts = attempts;
                next.job.last_error = Some(format!("artifact: {error}"));
                next.job.log(now, format!("completed without artifact after {attempts} attempts"));
            }
            (None, None) => next.job.log(now, "completed"),
        }
        next.job.artifact_reference = artifact;

        let committed = self.commit(&record, next).await?;
        info!(
            job_id = %job_id,
            pod_id = %pod.id,
            artifact = committed.job.artifact_reference.is_some(),
            "Job completed"
        );
        Ok(committed)
    }

    /// Download the trained weights from the pod and store them.
    async fn collect_artifact(
        &self,
        job_id: JobId,
        pod: &PodHandle,
        collected_at: DateTime<Utc>,
    ) -> Result<ArtifactReference> {
        let source = ArtifactSource {
            pod_id: pod.id.clone(),
            gpu_type: pod.gpu_type.clone(),
            remote_path: training::remote_output_path(job_id),
            collected_at,
        };
        let weights = self.provider.download_file(pod, &source.remote_path).await?;
        debug!(job_id = %job_id, pod_id = %pod.id, bytes = weights.len(), "Downloaded weights");
        Ok(self.artifacts.store(job_id, &source, &weights).await?)
    }

    // ========================================================================
    // Failure and cancellation
    // ========================================================================

    /// Fail a job, queue what it is owed back, and try to release its pod.
    async fn fail_from(
        &self,
        record: JobRecord,
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let job_id = record.job.id;
        let pod = record.job.pod_reference.clone();

        let compute = match (&pod, record.job.provisioned_at) {
            (Some(pod), Some(since)) if !reason.is_system() => self
                .pricing
                .compute_cost(&pod.gpu_type, (now - since).to_std().unwrap_or_default()),
            _ => Amount::zero(Currency::Usd),
        };

        let mut next = record.clone();
        next.job.status = JobStatus::Failed;
        next.job.failure_reason = Some(reason);
        next.job.finished_at = Some(now);
        next.job.allocating_since = None;
        next.job.teardown_pending = pod.is_some();
        next.job.log(now, format!("failed: {reason}"));

        let cost = match next.order.as_mut() {
            Some(order) if matches!(order.status, OrderStatus::Confirmed) => {
                let cost = compute.min(order.amount);
                order.queue_refund(order.amount.saturating_sub(cost), &reason.to_string(), now);
                cost
            }
            _ => compute,
        };
        next.job.cost_actual = Some(self.pricing.costs(cost));

        let failed = self.commit(&record, next).await?;
        warn!(job_id = %job_id, reason = %reason, cost = %cost, "Job failed");

        if pod.is_none() {
            return Ok(failed);
        }
        match self.release_pod(failed.clone(), now).await {
            Ok(released) => Ok(released),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Pod teardown deferred to reconciliation");
                Ok(self.store.get(job_id).await.unwrap_or(failed))
            }
        }
    }

    /// Terminate the pod of a finished job and clear it from the record.
    async fn release_pod(&self, record: JobRecord, now: DateTime<Utc>) -> Result<JobRecord> {
        let job_id = record.job.id;
        let Some(pod) = record.job.pod_reference.clone() else {
            let mut next = record.clone();
            next.job.teardown_pending = false;
            return self.commit(&record, next).await;
        };

        if let Err(e) = self.provider.terminate(&pod).await {
            let mut next = record.clone();
            next.job.last_error = Some(format!("teardown: {e}"));
            next.job.log(now, format!("teardown of pod {} failed: {e}", pod.id));
            if let Err(err) = self.commit(&record, next).await {
                debug!(job_id = %job_id, error = %err, "Could not record teardown failure");
            }
            return Err(OrchestratorError::Teardown {
                pod_id: pod.id,
                message: e.to_string(),
            });
        }

        let mut next = record.clone();
        next.job.released_pod = next.job.pod_reference.take();
        next.job.teardown_pending = false;
        next.job.log(now, format!("pod {} terminated", pod.id));
        let released = self.commit(&record, next).await?;
        info!(job_id = %job_id, pod_id = %pod.id, "Pod terminated");
        Ok(released)
    }

    /// Retry teardown for a finished job whose pod may still be alive.
    pub async fn retry_teardown(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord> {
        self.with_conflict_retry(job_id, |record| async move {
            if !(record.job.teardown_pending && record.job.status.is_terminal()) {
                return Ok(record);
            }
            self.release_pod(record, now).await
        })
        .await
    }

    /// Cancel a job on behalf of its owner.
    ///
    /// Unpaid jobs are cancelled outright. Paid jobs fail with
    /// `cancelled_by_owner` and are refunded what compute did not use.
    pub async fn cancel(
        &self,
        job_id: JobId,
        owner: &OwnerId,
        now: DateTime<Utc>,
    ) -> Result<JobView> {
        let record = self.owned(job_id, owner).await?;

        let record = match record.job.status {
            JobStatus::Draft | JobStatus::PendingPayment => {
                let mut next = record.clone();
                next.job.status = JobStatus::Cancelled;
                next.job.finished_at = Some(now);
                next.job.log(now, "cancelled by owner");
                if let Some(order) = next.order.as_mut() {
                    if order.status == OrderStatus::Created {
                        order.status = OrderStatus::Failed;
                    }
                }
                self.commit(&record, next).await?
            }
            JobStatus::Provisioning | JobStatus::Running => {
                if record.job.completion_claimed.is_some() {
                    return Err(OrchestratorError::StaleStateConflict { job_id });
                }
                self.fail_from(record, FailureReason::CancelledByOwner, now)
                    .await?
            }
            from => {
                return Err(OrchestratorError::InvalidTransition {
                    from,
                    to: JobStatus::Cancelled,
                })
            }
        };
        Ok(JobView::from(&record))
    }

    // ========================================================================
    // Deadlines and refunds
    // ========================================================================

    /// Which timeout, if any, a job has exceeded.
    pub fn overdue(&self, record: &JobRecord, now: DateTime<Utc>) -> Option<FailureReason> {
        let job = &record.job;
        let policy = &self.config.policy;
        if !job.status.holds_pod() || job.completion_claimed.is_some() {
            return None;
        }

        if job.status == JobStatus::Provisioning {
            let started = job
                .provisioned_at
                .or_else(|| record.order.as_ref().and_then(|o| o.confirmed_at));
            if started.is_some_and(|t| now - t > to_delta(policy.startup_timeout)) {
                return Some(FailureReason::StartupTimeout);
            }
        }
        if job.pod_reference.is_some() {
            let seen = job.last_seen_at.or(job.provisioned_at);
            if seen.is_some_and(|t| now - t > to_delta(policy.grace_window)) {
                return Some(FailureReason::StatusTimeout);
            }
        }
        None
    }

    /// Fail a job that exceeded a timeout. Returns the reason if it did.
    pub async fn enforce_timeouts(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureReason>> {
        self.with_conflict_retry(job_id, |record| async move {
            let Some(reason) = self.overdue(&record, now) else {
                return Ok(None);
            };
            if record.job.status == JobStatus::Provisioning
                && record.job.pod_reference.is_none()
                && !self.needs_allocation(&record, now)
            {
                // An allocator is still working on it.
                return Ok(None);
            }
            self.fail_from(record, reason, now).await.map(|_| Some(reason))
        })
        .await
    }

    /// Issue every queued refund of a job. Returns how many were issued.
    pub async fn process_refund(&self, job_id: JobId, now: DateTime<Utc>) -> Result<usize> {
        let record = self.store.get(job_id).await?;
        let queued: Vec<PaymentOrder> = record
            .orders()
            .filter(|o| o.has_queued_refund())
            .cloned()
            .collect();

        let mut issued = 0;
        for order in queued {
            let (Some(intent_id), Some(refund)) = (order.intent_id.as_deref(), order.refund.as_ref())
            else {
                warn!(job_id = %job_id, order_id = %order.id, "Queued refund without a payment intent");
                continue;
            };

            let handle = self
                .gateway
                .refund(intent_id, refund.amount, &order.refund_key())
                .await?;
            info!(
                job_id = %job_id,
                order_id = %order.id,
                refund_id = %handle.refund_id,
                amount = %refund.amount,
                "Refund issued"
            );

            let order_id = order.id;
            self.with_conflict_retry(job_id, |record| {
                let refund_id = handle.refund_id.clone();
                async move {
                    let mut next = record.clone();
                    let Some(refund) = next.order_mut(order_id).and_then(|o| o.refund.as_mut()) else {
                        return Ok(());
                    };
                    if refund.status == RefundStatus::Issued {
                        return Ok(());
                    }
                    refund.status = RefundStatus::Issued;
                    refund.provider_refund_id = Some(refund_id.clone());
                    let amount = refund.amount;
                    next.job.log(now, format!("refund of {amount} issued ({refund_id})"));
                    self.commit(&record, next).await.map(|_| ())
                }
            })
            .await?;
            issued += 1;
        }
        Ok(issued)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Status view of one job.
    pub async fn job(&self, job_id: JobId, owner: &OwnerId) -> Result<JobView> {
        self.owned(job_id, owner).await.map(|r| JobView::from(&r))
    }

    /// Status views of an owner's jobs, newest first.
    pub async fn jobs(&self, owner: &OwnerId) -> Result<Vec<JobView>> {
        Ok(self
            .store
            .list_by_owner(owner)
            .await?
            .iter()
            .map(JobView::from)
            .collect())
    }
}

fn to_delta(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_to_delta_saturates() {
        assert_eq!(to_delta(Duration::from_secs(60)), chrono::Duration::seconds(60));
        assert!(to_delta(Duration::MAX) > chrono::Duration::weeks(52));
    }
}
