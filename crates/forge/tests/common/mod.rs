//! Shared fakes and fixtures for orchestrator tests.

#![allow(dead_code)]
#![allow(clippy::missing_panics_doc)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use forge::artifacts::{ArtifactError, ArtifactSource, ArtifactStore};
use forge::config::StripeConfig;
use forge::model::ArtifactReference;
use forge::{Config, JobId, JobRecord, JobStore, MemoryStore, Orchestrator, OwnerId, SubmitJob};
use forge_gpu::{GpuProvider, GpuProviderError, PodHandle, PodSpec, PodStatus, RetryPolicy};
use forge_payments::{
    Amount, IntentHandle, ParsedEvent, PaymentError, PaymentEventKind, PaymentGateway,
    RefundHandle, SignatureError, WebhookVerifier,
};
use tokio::sync::Notify;

pub const WEBHOOK_SECRET: &str = "whsec_test";
pub const CALLBACK_TOKEN: &str = "cb-token";

/// Fixed start of simulated time.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

// ============================================================================
// GPU provider
// ============================================================================

#[derive(Default)]
pub struct ProviderState {
    /// GPU types that report no capacity.
    pub sold_out: BTreeSet<String>,
    /// GPU types that reject the request permanently.
    pub rejected: BTreeSet<String>,
    /// Upcoming terminate calls that time out.
    pub terminate_failures: u32,
    /// Upcoming find_by_name calls that time out.
    pub lookup_failures: u32,
    /// Polls time out while set.
    pub poll_unreachable: bool,
    /// Upcoming allocations that create the pod but time out before answering.
    pub lost_responses: u32,
    /// Upcoming downloads that time out.
    pub download_failures: u32,
    /// Parks the next allocation after it created its pod.
    pub hold: Option<Arc<AllocationHold>>,
    /// Reported status by pod id. Pods missing here report `unknown`.
    pub statuses: HashMap<String, PodStatus>,
    /// Live pods by name.
    pub live: BTreeMap<String, PodHandle>,
    pub allocations: Vec<(String, PodSpec)>,
    pub terminated: Vec<String>,
    next_id: u32,
}

/// Lets a test pause an allocator between pod creation and its response.
#[derive(Default)]
pub struct AllocationHold {
    /// Signalled once the pod exists.
    pub created: Notify,
    /// Signal to let the allocation return.
    pub release: Notify,
}

/// Scripted in-memory GPU provider.
#[derive(Default)]
pub struct FakeProvider {
    pub state: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn with<R>(&self, f: impl FnOnce(&mut ProviderState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_status(&self, pod_id: &str, status: PodStatus) {
        self.with(|s| s.statuses.insert(pod_id.to_string(), status));
    }

    pub fn live_count(&self) -> usize {
        self.with(|s| s.live.len())
    }
}

#[async_trait]
impl GpuProvider for FakeProvider {
    async fn allocate(&self, gpu_type: &str, spec: &PodSpec) -> Result<PodHandle, GpuProviderError> {
        let (result, hold) = self.with(|s| {
            let result = Self::deploy(s, gpu_type, spec);
            let hold = if result.is_ok() { s.hold.take() } else { None };
            (result, hold)
        });
        if let Some(hold) = hold {
            hold.created.notify_one();
            hold.release.notified().await;
        }
        result
    }

    async fn poll_status(&self, pod: &PodHandle) -> Result<PodStatus, GpuProviderError> {
        self.with(|s| {
            if s.poll_unreachable {
                return Err(GpuProviderError::Timeout(30));
            }
            Ok(s.statuses.get(&pod.id).copied().unwrap_or(PodStatus::Unknown))
        })
    }

    async fn terminate(&self, pod: &PodHandle) -> Result<(), GpuProviderError> {
        self.with(|s| {
            if s.terminate_failures > 0 {
                s.terminate_failures -= 1;
                return Err(GpuProviderError::Timeout(30));
            }
            s.live.retain(|_, live| live.id != pod.id);
            s.terminated.push(pod.id.clone());
            Ok(())
        })
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<PodHandle>, GpuProviderError> {
        self.with(|s| {
            if s.lookup_failures > 0 {
                s.lookup_failures -= 1;
                return Err(GpuProviderError::Timeout(30));
            }
            Ok(s.live.get(name).cloned())
        })
    }

    async fn download_file(
        &self,
        pod: &PodHandle,
        _remote_path: &str,
    ) -> Result<Vec<u8>, GpuProviderError> {
        self.with(|s| {
            if s.download_failures > 0 {
                s.download_failures -= 1;
                return Err(GpuProviderError::Timeout(30));
            }
            if !s.live.values().any(|live| live.id == pod.id) {
                return Err(GpuProviderError::Invalid(format!("pod {} not found", pod.id)));
            }
            Ok(format!("weights-{}", pod.id).into_bytes())
        })
    }
}

impl FakeProvider {
    fn deploy(s: &mut ProviderState, gpu_type: &str, spec: &PodSpec) -> Result<PodHandle, GpuProviderError> {
        if s.sold_out.contains(gpu_type) {
            return Err(GpuProviderError::Capacity {
                gpu_type: gpu_type.to_string(),
                message: "There are no longer any instances available".to_string(),
            });
        }
        if s.rejected.contains(gpu_type) {
            return Err(GpuProviderError::Invalid("template not found".to_string()));
        }
        s.next_id += 1;
        let pod = PodHandle::new(format!("pod-{}", s.next_id), gpu_type);
        s.statuses.insert(pod.id.clone(), PodStatus::Starting);
        s.live.insert(spec.name.clone(), pod.clone());
        s.allocations.push((gpu_type.to_string(), spec.clone()));
        if s.lost_responses > 0 {
            s.lost_responses -= 1;
            return Err(GpuProviderError::Timeout(30));
        }
        Ok(pod)
    }
}

// ============================================================================
// Payment gateway
// ============================================================================

/// In-memory payment gateway with a real webhook verifier.
pub struct FakeGateway {
    verifier: WebhookVerifier,
    intents: AtomicU32,
    pub fail_intents: AtomicBool,
    pub fail_refunds: AtomicBool,
    /// (intent id, amount, idempotency key)
    pub refunds: Mutex<Vec<(String, Amount, String)>>,
    pub intent_keys: Mutex<Vec<String>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            verifier: WebhookVerifier::new(WEBHOOK_SECRET),
            intents: AtomicU32::new(0),
            fail_intents: AtomicBool::new(false),
            fail_refunds: AtomicBool::new(false),
            refunds: Mutex::new(Vec::new()),
            intent_keys: Mutex::new(Vec::new()),
        }
    }
}

impl FakeGateway {
    pub fn refund_count(&self) -> usize {
        self.refunds.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_intent(
        &self,
        _amount: Amount,
        _job_id: &str,
        idempotency_key: &str,
    ) -> Result<IntentHandle, PaymentError> {
        if self.fail_intents.load(Ordering::SeqCst) {
            return Err(PaymentError::Api {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        self.intent_keys
            .lock()
            .unwrap()
            .push(idempotency_key.to_string());
        let n = self.intents.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(IntentHandle {
            intent_id: format!("pi_{n}"),
            client_secret: Some(format!("pi_{n}_secret")),
        })
    }

    async fn refund(
        &self,
        intent_id: &str,
        amount: Amount,
        idempotency_key: &str,
    ) -> Result<RefundHandle, PaymentError> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(PaymentError::Api {
                status: 502,
                message: "bad gateway".to_string(),
            });
        }
        let mut refunds = self.refunds.lock().unwrap();
        refunds.push((intent_id.to_string(), amount, idempotency_key.to_string()));
        Ok(RefundHandle {
            refund_id: format!("re_{}", refunds.len()),
            status: "succeeded".to_string(),
        })
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<ParsedEvent, SignatureError> {
        self.verifier.verify(payload, signature_header)
    }
}

// ============================================================================
// Artifact store
// ============================================================================

#[derive(Default)]
pub struct FakeArtifacts {
    pub failures: AtomicU32,
    pub stored: Mutex<Vec<(JobId, ArtifactSource, Vec<u8>)>>,
}

#[async_trait]
impl ArtifactStore for FakeArtifacts {
    async fn store(
        &self,
        job_id: JobId,
        source: &ArtifactSource,
        weights: &[u8],
    ) -> Result<ArtifactReference, ArtifactError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ArtifactError::Io(std::io::Error::other("disk full")));
        }
        self.stored
            .lock()
            .unwrap()
            .push((job_id, source.clone(), weights.to_vec()));
        Ok(ArtifactReference {
            uri: format!("memory://{job_id}"),
            size_bytes: weights.len() as u64,
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn test_config() -> Config {
    Config {
        public_url: "https://forge.test".to_string(),
        callback_token: Some(CALLBACK_TOKEN.to_string()),
        retry: RetryPolicy::immediate(1),
        stripe: StripeConfig {
            webhook_secret: WEBHOOK_SECRET.to_string(),
            ..StripeConfig::default()
        },
        ..Config::default()
    }
}

#[derive(Clone)]
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<FakeProvider>,
    pub gateway: Arc<FakeGateway>,
    pub artifacts: Arc<FakeArtifacts>,
    pub config: Arc<Config>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FakeProvider::default());
        let gateway = Arc::new(FakeGateway::default());
        let artifacts = Arc::new(FakeArtifacts::default());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            provider.clone(),
            gateway.clone(),
            artifacts.clone(),
            Arc::clone(&config),
        ));
        Self {
            orchestrator,
            store,
            provider,
            gateway,
            artifacts,
            config,
        }
    }

    pub async fn record(&self, job_id: JobId) -> JobRecord {
        self.store.get(job_id).await.unwrap()
    }

    /// Intent id of the job's current order.
    pub async fn intent(&self, job_id: JobId) -> String {
        self.record(job_id)
            .await
            .order
            .and_then(|o| o.intent_id)
            .unwrap()
    }

    /// Submit a job and return its id.
    pub async fn submit(&self, owner: &str, now: DateTime<Utc>) -> JobId {
        self.orchestrator
            .submit(owner.into(), request(), now)
            .await
            .unwrap()
            .id
    }

    /// Submit a job and confirm its payment.
    pub async fn paid_job(&self, owner: &str, now: DateTime<Utc>) -> JobId {
        let job_id = self.submit(owner, now).await;
        let intent = self.intent(job_id).await;
        self.orchestrator
            .handle_payment_event(
                &event(&format!("evt_paid_{job_id}"), "payment_intent.succeeded", &intent),
                now,
            )
            .await
            .unwrap();
        job_id
    }

    /// A paid job with an allocated pod. Returns the job and pod ids.
    pub async fn provisioned_job(&self, owner: &str, now: DateTime<Utc>) -> (JobId, String) {
        let job_id = self.paid_job(owner, now).await;
        self.orchestrator.provision(job_id, now).await.unwrap();
        let pod = self.record(job_id).await.job.pod_reference.unwrap();
        (job_id, pod.id)
    }

    /// A job whose pod reported running.
    pub async fn running_job(&self, owner: &str, now: DateTime<Utc>) -> (JobId, String) {
        let (job_id, pod_id) = self.provisioned_job(owner, now).await;
        self.provider.set_status(&pod_id, PodStatus::Running);
        self.orchestrator
            .apply_pod_status(job_id, Some(&pod_id), PodStatus::Running, now)
            .await
            .unwrap();
        (job_id, pod_id)
    }
}

pub fn owner(name: &str) -> OwnerId {
    OwnerId::from(name)
}

pub fn request() -> SubmitJob {
    SubmitJob {
        project_name: "Studio portraits".to_string(),
        image_set: "uploads/portraits".to_string(),
        image_count: 12,
        trigger_token: "sks".to_string(),
        ..SubmitJob::default()
    }
}

/// A verified payment event carrying an amount.
pub fn event_with_amount(id: &str, kind: &str, intent_id: &str, minor: i64) -> ParsedEvent {
    ParsedEvent {
        amount: Some(minor),
        ..event(id, kind, intent_id)
    }
}

/// A verified payment event.
pub fn event(id: &str, kind: &str, intent_id: &str) -> ParsedEvent {
    ParsedEvent {
        id: id.to_string(),
        kind: PaymentEventKind::from_type(kind),
        intent_id: Some(intent_id.to_string()),
        job_id: None,
        amount: None,
        created_at: t0(),
    }
}
