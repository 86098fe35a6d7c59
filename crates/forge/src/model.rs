//! Training job and payment order records.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use forge_gpu::PodHandle;
use forge_payments::{Amount, Currency};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Training job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Payment order identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub Uuid);

impl OrderId {
    /// Generate a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account that owns a job. Issued by the upstream auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Generate a short payment code (`AMF-` + 8 upper-case hex chars).
#[must_use]
pub fn generate_payment_reference() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("AMF-{}", hex[..8].to_uppercase())
}

// ============================================================================
// Job status
// ============================================================================

/// Lifecycle state of a training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, no payment order yet.
    Draft,
    /// Payment intent created, waiting for confirmation.
    PendingPayment,
    /// Paid; a pod is being allocated or starting.
    Provisioning,
    /// Training is running on the pod.
    Running,
    /// Artifact delivered, pod torn down.
    Completed,
    /// Failed with a recorded reason.
    Failed,
    /// Cancelled before payment confirmed.
    Cancelled,
}

impl JobStatus {
    /// Whether the job reached a final state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a pod may be attached in this state.
    #[must_use]
    pub fn holds_pod(self) -> bool {
        matches!(self, Self::Provisioning | Self::Running)
    }

    /// Whether moving to `next` is allowed. Self-transitions are bookkeeping writes.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobStatus::{Cancelled, Completed, Draft, Failed, PendingPayment, Provisioning, Running};

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Draft, PendingPayment | Cancelled)
                | (PendingPayment, Provisioning | Cancelled)
                | (Provisioning, Running | Completed | Failed)
                | (Running, Completed | Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::PendingPayment => write!(f, "pending_payment"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Every preferred GPU type was out of capacity.
    NoCapacity,
    /// Allocation failed for reasons other than capacity.
    AllocationFailed,
    /// The provider reported the pod errored.
    PodError,
    /// No provider answer within the grace window.
    StatusTimeout,
    /// The pod never started running.
    StartupTimeout,
    /// The owner cancelled a paid job.
    CancelledByOwner,
}

impl FailureReason {
    /// Whether the failure is on our side (the owner gets a full refund).
    #[must_use]
    pub fn is_system(self) -> bool {
        !matches!(self, Self::CancelledByOwner)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCapacity => write!(f, "no_capacity"),
            Self::AllocationFailed => write!(f, "allocation_failed"),
            Self::PodError => write!(f, "pod_error"),
            Self::StatusTimeout => write!(f, "status_timeout"),
            Self::StartupTimeout => write!(f, "startup_timeout"),
            Self::CancelledByOwner => write!(f, "cancelled_by_owner"),
        }
    }
}

// ============================================================================
// Job
// ============================================================================

/// Immutable training parameters captured at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Project name shown to the owner.
    pub project_name: String,
    /// Pricing tier the job was quoted at.
    #[serde(default)]
    pub model_type: String,
    /// Base checkpoint the LoRA is trained against.
    #[serde(default)]
    pub base_model: String,
    /// Reference to the uploaded image set.
    pub image_set: String,
    /// Number of images in the set.
    pub image_count: u32,
    /// Training steps.
    pub steps: u32,
    /// Learning rate.
    pub learning_rate: f64,
    /// Whether to train the text encoder.
    pub train_text_encoder: bool,
    /// Trigger token for the concept.
    pub trigger_token: String,
    /// Dataset repeat count.
    pub repeat: u32,
    /// GPU types, most preferred first, without duplicates.
    pub gpu_preferences: Vec<String>,
}

/// Amount charged plus its display conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Costs {
    /// Charge currency amount (USD).
    pub charge: Amount,
    /// Display currency amount (CNY).
    pub display: Amount,
}

impl Costs {
    /// Zero costs.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            charge: Amount::zero(Currency::Usd),
            display: Amount::zero(Currency::Cny),
        }
    }
}

/// Where a finished model lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    /// Location of the stored weights.
    pub uri: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Most entries kept in a job's event log; older ones are dropped.
pub const MAX_JOB_EVENTS: usize = 50;

/// One line of a job's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// A LoRA training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: JobId,
    pub owner: OwnerId,
    pub status: JobStatus,
    pub config: TrainingConfig,
    pub pod_reference: Option<PodHandle>,
    /// Pod the job ran on, kept after teardown for billing and artifact retries.
    #[serde(default)]
    pub released_pod: Option<PodHandle>,
    pub cost_estimate: Costs,
    pub cost_actual: Option<Costs>,
    pub created_at: DateTime<Utc>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<FailureReason>,
    pub artifact_reference: Option<ArtifactReference>,

    /// Optimistic lock counter, bumped by every committed write.
    pub version: u64,
    /// A pod may still be alive and must be terminated.
    #[serde(default)]
    pub teardown_pending: bool,
    /// The last attempt at collecting the artifact failed; completion retries it.
    #[serde(default)]
    pub artifact_pending: bool,
    /// Failed artifact collection attempts.
    #[serde(default)]
    pub artifact_attempts: u32,
    /// When the provider reported success and finalization began.
    #[serde(default)]
    pub completion_claimed: Option<DateTime<Utc>>,
    /// When an allocator claimed the job.
    #[serde(default)]
    pub allocating_since: Option<DateTime<Utc>>,
    /// Last provider observation that changed the job.
    #[serde(default)]
    pub last_provider_update: Option<DateTime<Utc>>,
    /// Last time the provider answered for the pod at all.
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub running_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Short code used to match payments by hand.
    pub payment_reference: String,
    /// Service deadline, set when payment confirms.
    #[serde(default)]
    pub deadline_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Bounded history shown in the status view.
    #[serde(default)]
    pub events: Vec<JobEvent>,
}

impl TrainingJob {
    /// Create a draft job.
    #[must_use]
    pub fn draft(
        owner: OwnerId,
        config: TrainingConfig,
        cost_estimate: Costs,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            owner,
            status: JobStatus::Draft,
            config,
            pod_reference: None,
            released_pod: None,
            cost_estimate,
            cost_actual: None,
            created_at: now,
            provisioned_at: None,
            completed_at: None,
            failure_reason: None,
            artifact_reference: None,
            version: 0,
            teardown_pending: false,
            artifact_pending: false,
            artifact_attempts: 0,
            completion_claimed: None,
            allocating_since: None,
            last_provider_update: None,
            last_seen_at: None,
            running_since: None,
            finished_at: None,
            payment_reference: generate_payment_reference(),
            deadline_at: None,
            last_error: None,
            events: Vec::new(),
        }
    }

    /// Append to the event log, dropping the oldest entries past the bound.
    pub fn log(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        self.events.push(JobEvent {
            at,
            message: message.into(),
        });
        if self.events.len() > MAX_JOB_EVENTS {
            let excess = self.events.len() - MAX_JOB_EVENTS;
            self.events.drain(..excess);
        }
    }
}

// ============================================================================
// Payment order
// ============================================================================

/// Payment order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Confirmed,
    Failed,
    Refunded,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Failed => write!(f, "failed"),
            Self::Refunded => write!(f, "refunded"),
        }
    }
}

/// Refund progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    /// Owed but not yet sent to the gateway.
    Queued,
    /// Accepted by the gateway.
    Issued,
}

/// A refund owed on an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub amount: Amount,
    pub status: RefundStatus,
    pub reason: String,
    pub provider_refund_id: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// Payment for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOrder {
    pub id: OrderId,
    pub job_id: JobId,
    pub intent_id: Option<String>,
    pub client_secret: Option<String>,
    /// Webhook events already applied to this order.
    pub provider_event_ids: BTreeSet<String>,
    pub status: OrderStatus,
    pub amount: Amount,
    pub refund: Option<Refund>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PaymentOrder {
    /// Create an order for a job.
    #[must_use]
    pub fn new(job_id: JobId, amount: Amount, now: DateTime<Utc>) -> Self {
        Self {
            id: OrderId::new(),
            job_id,
            intent_id: None,
            client_secret: None,
            provider_event_ids: BTreeSet::new(),
            status: OrderStatus::Created,
            amount,
            refund: None,
            confirmed_at: None,
            created_at: now,
        }
    }

    /// Queue a refund unless one already exists. Zero amounts are skipped.
    pub fn queue_refund(&mut self, amount: Amount, reason: &str, now: DateTime<Utc>) -> bool {
        if self.refund.is_some() || amount.is_zero() {
            return false;
        }
        self.refund = Some(Refund {
            amount: amount.min(self.amount),
            status: RefundStatus::Queued,
            reason: reason.to_string(),
            provider_refund_id: None,
            requested_at: now,
        });
        true
    }

    /// Whether a refund is waiting to be issued.
    #[must_use]
    pub fn has_queued_refund(&self) -> bool {
        self.refund
            .as_ref()
            .is_some_and(|r| r.status == RefundStatus::Queued)
    }

    /// Idempotency key for refunding this order.
    #[must_use]
    pub fn refund_key(&self) -> String {
        format!("refund-{}", self.id)
    }

    /// Idempotency key for creating this order's intent.
    #[must_use]
    pub fn intent_key(&self) -> String {
        format!("intent-{}", self.id)
    }
}

// ============================================================================
// Record
// ============================================================================

/// A job together with its payment orders, stored and swapped as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: TrainingJob,
    /// Current order.
    pub order: Option<PaymentOrder>,
    /// Orders replaced by a renewal.
    #[serde(default)]
    pub superseded_orders: Vec<PaymentOrder>,
}

impl JobRecord {
    /// Wrap a new job without orders.
    #[must_use]
    pub fn new(job: TrainingJob) -> Self {
        Self {
            job,
            order: None,
            superseded_orders: Vec::new(),
        }
    }

    /// All orders, current first.
    pub fn orders(&self) -> impl Iterator<Item = &PaymentOrder> {
        self.order.iter().chain(self.superseded_orders.iter())
    }

    /// Mutable access to the order holding an intent.
    pub fn order_for_intent_mut(&mut self, intent_id: &str) -> Option<&mut PaymentOrder> {
        self.order
            .iter_mut()
            .chain(self.superseded_orders.iter_mut())
            .find(|o| o.intent_id.as_deref() == Some(intent_id))
    }

    /// Mutable access to an order by id.
    pub fn order_mut(&mut self, id: OrderId) -> Option<&mut PaymentOrder> {
        self.order
            .iter_mut()
            .chain(self.superseded_orders.iter_mut())
            .find(|o| o.id == id)
    }

    /// Whether any order holds the intent.
    #[must_use]
    pub fn has_intent(&self, intent_id: &str) -> bool {
        self.orders()
            .any(|o| o.intent_id.as_deref() == Some(intent_id))
    }

    /// Whether any order owes a refund.
    #[must_use]
    pub fn has_queued_refund(&self) -> bool {
        self.orders().any(PaymentOrder::has_queued_refund)
    }

    /// Whether the record still needs reconciliation work.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        let job = &self.job;
        job.status.holds_pod() || job.teardown_pending || job.artifact_pending || self.has_queued_refund()
    }

    /// Check the cross-field invariants of a record.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        let job = &self.job;

        if job.pod_reference.is_some() && !job.status.holds_pod() && !job.teardown_pending {
            return Err("pod attached to a job that cannot hold one");
        }
        if matches!(
            job.status,
            JobStatus::Provisioning | JobStatus::Running | JobStatus::Completed
        ) && !self
            .order
            .as_ref()
            .is_some_and(|o| matches!(o.status, OrderStatus::Confirmed | OrderStatus::Refunded))
        {
            return Err("paid state without a confirmed order");
        }
        if job.failure_reason.is_some() != (job.status == JobStatus::Failed) {
            return Err("failure reason only belongs to failed jobs");
        }
        if job.artifact_reference.is_some() && job.status != JobStatus::Completed {
            return Err("artifact reference only belongs to completed jobs");
        }
        Ok(())
    }
}

// ============================================================================
// Views
// ============================================================================

/// What the status query returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub project_name: String,
    pub model_type: String,
    pub gpu_type: Option<String>,
    pub cost_estimate: Costs,
    pub cost_actual: Option<Costs>,
    pub payment_reference: String,
    pub payment_status: Option<OrderStatus>,
    /// Client secret for the checkout form while payment is pending.
    pub client_secret: Option<String>,
    pub refund: Option<Refund>,
    pub created_at: DateTime<Utc>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<FailureReason>,
    pub artifact_reference: Option<ArtifactReference>,
    pub events: Vec<JobEvent>,
}

impl From<&JobRecord> for JobView {
    fn from(record: &JobRecord) -> Self {
        let job = &record.job;
        let order = record.order.as_ref();
        Self {
            id: job.id,
            status: job.status,
            project_name: job.config.project_name.clone(),
            model_type: job.config.model_type.clone(),
            gpu_type: job.pod_reference.as_ref().map(|p| p.gpu_type.clone()),
            cost_estimate: job.cost_estimate,
            cost_actual: job.cost_actual,
            payment_reference: job.payment_reference.clone(),
            payment_status: order.map(|o| o.status),
            client_secret: order
                .filter(|o| o.status == OrderStatus::Created)
                .and_then(|o| o.client_secret.clone()),
            refund: order.and_then(|o| o.refund.clone()),
            created_at: job.created_at,
            provisioned_at: job.provisioned_at,
            completed_at: job.completed_at,
            deadline_at: job.deadline_at,
            failure_reason: job.failure_reason,
            artifact_reference: job.artifact_reference.clone(),
            events: job.events.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use JobStatus::*;

        assert!(Draft.can_transition_to(PendingPayment));
        assert!(Draft.can_transition_to(Cancelled));
        assert!(PendingPayment.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Running));

        assert!(!Draft.can_transition_to(Provisioning));
        assert!(!PendingPayment.can_transition_to(Running));
        assert!(!Running.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(PendingPayment));
    }

    #[test]
    fn test_payment_reference_format() {
        let reference = generate_payment_reference();
        assert_eq!(reference.len(), 12);
        assert!(reference.starts_with("AMF-"));
        assert!(reference[4..]
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
    }

    #[test]
    fn test_refund_is_queued_once_and_capped() {
        let now = Utc::now();
        let mut order = PaymentOrder::new(JobId::new(), Amount::usd(1500), now);

        assert!(!order.queue_refund(Amount::usd(0), "nothing owed", now));
        assert!(order.queue_refund(Amount::usd(9000), "no_capacity", now));
        assert!(!order.queue_refund(Amount::usd(100), "again", now));

        let refund = order.refund.as_ref().unwrap();
        assert_eq!(refund.amount, Amount::usd(1500));
        assert!(order.has_queued_refund());
    }

    fn job() -> TrainingJob {
        let config = TrainingConfig {
            project_name: "p".into(),
            model_type: "character".into(),
            base_model: "sdxl".into(),
            image_set: "s".into(),
            image_count: 10,
            steps: 100,
            learning_rate: 0.0001,
            train_text_encoder: false,
            trigger_token: "sks".into(),
            repeat: 5,
            gpu_preferences: vec!["NVIDIA_L4".into()],
        };
        TrainingJob::draft(OwnerId::from("alice"), config, Costs::zero(), Utc::now())
    }

    #[test]
    fn test_event_log_is_bounded() {
        let mut job = job();
        let start = Utc::now();
        for n in 0..(MAX_JOB_EVENTS + 7) {
            job.log(start + chrono::Duration::seconds(n as i64), format!("event {n}"));
        }

        assert_eq!(job.events.len(), MAX_JOB_EVENTS);
        assert_eq!(job.events[0].message, "event 7");
        assert_eq!(
            job.events.last().unwrap().message,
            format!("event {}", MAX_JOB_EVENTS + 6)
        );
    }

    #[test]
    fn test_records_without_new_fields_still_load() {
        let mut value = serde_json::to_value(job()).unwrap();
        let object = value.as_object_mut().unwrap();
        object.remove("events");
        object.remove("artifact_attempts");

        let job: TrainingJob = serde_json::from_value(value).unwrap();
        assert!(job.events.is_empty());
        assert_eq!(job.artifact_attempts, 0);
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&JobStatus::PendingPayment).unwrap(),
            "\"pending_payment\""
        );
        assert_eq!(FailureReason::NoCapacity.to_string(), "no_capacity");
        assert_eq!(
            serde_json::to_string(&FailureReason::CancelledByOwner).unwrap(),
            "\"cancelled_by_owner\""
        );
    }
}
