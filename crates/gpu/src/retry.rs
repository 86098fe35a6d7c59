//! Bounded exponential backoff for transient provider failures.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::providers::traits::{GpuProvider, GpuProviderError, PodHandle, PodSpec, PodStatus};

/// Retry policy for provider calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits, for tests and one-shot tools.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate the delay after the given (zero-based) failed attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(16)).unwrap_or(16);
        let multiplier = self.backoff_multiplier.powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if another attempt is allowed after `attempt` attempts were made.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Worst-case time spent sleeping between attempts of one call.
    #[must_use]
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Permanent errors are returned as-is. A transient error on the last
    /// attempt is wrapped in [`GpuProviderError::RetriesExhausted`].
    ///
    /// # Errors
    /// Returns the permanent error, or `RetriesExhausted` with the last transient error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, GpuProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GpuProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if !self.should_retry(attempt) => {
                    return Err(GpuProviderError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt - 1);
                    warn!(
                        operation = %what,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Provider wrapper that retries transient failures of the inner provider.
pub struct RetryingProvider<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: GpuProvider> RetryingProvider<P> {
    /// Wrap a provider with the given policy.
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Access the wrapped provider.
    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: GpuProvider> GpuProvider for RetryingProvider<P> {
    /// Allocation is not idempotent: a transient failure can hide a pod
    /// that was created anyway. Before every redeploy, and after the last
    /// failed attempt, look the pod up by name and adopt it if it exists.
    async fn allocate(
        &self,
        gpu_type: &str,
        spec: &PodSpec,
    ) -> Result<PodHandle, GpuProviderError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.inner.allocate(gpu_type, spec).await {
                Ok(pod) => return Ok(pod),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            let existing = self
                .policy
                .run("find_by_name", || self.inner.find_by_name(&spec.name))
                .await?;
            if let Some(pod) = existing {
                warn!(
                    pod_id = %pod.id,
                    name = %spec.name,
                    error = %error,
                    "Allocation reported failure but the pod exists, adopting it"
                );
                return Ok(pod);
            }

            if !self.policy.should_retry(attempt) {
                return Err(GpuProviderError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }
            let delay = self.policy.delay_for_attempt(attempt - 1);
            warn!(
                operation = "allocate",
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Transient provider error, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn poll_status(&self, pod: &PodHandle) -> Result<PodStatus, GpuProviderError> {
        self.policy
            .run("poll_status", || self.inner.poll_status(pod))
            .await
    }

    async fn terminate(&self, pod: &PodHandle) -> Result<(), GpuProviderError> {
        self.policy
            .run("terminate", || self.inner.terminate(pod))
            .await
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<PodHandle>, GpuProviderError> {
        self.policy
            .run("find_by_name", || self.inner.find_by_name(name))
            .await
    }

    async fn download_file(
        &self,
        pod: &PodHandle,
        remote_path: &str,
    ) -> Result<Vec<u8>, GpuProviderError> {
        self.policy
            .run("download_file", || self.inner.download_file(pod, remote_path))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Creates the pod on the first deploy but reports a lost response for
    /// the first `lost` calls.
    #[derive(Default)]
    struct LossyProvider {
        lost: u32,
        deploys: AtomicU32,
        pods: Mutex<Vec<(String, PodHandle)>>,
    }

    #[async_trait]
    impl GpuProvider for LossyProvider {
        async fn allocate(
            &self,
            gpu_type: &str,
            spec: &PodSpec,
        ) -> Result<PodHandle, GpuProviderError> {
            let n = self.deploys.fetch_add(1, Ordering::SeqCst);
            let pod = PodHandle::new(format!("pod-{n}"), gpu_type);
            self.pods.lock().unwrap().push((spec.name.clone(), pod.clone()));
            if n < self.lost {
                return Err(GpuProviderError::Timeout(30));
            }
            Ok(pod)
        }

        async fn poll_status(&self, _pod: &PodHandle) -> Result<PodStatus, GpuProviderError> {
            Ok(PodStatus::Running)
        }

        async fn terminate(&self, _pod: &PodHandle) -> Result<(), GpuProviderError> {
            Ok(())
        }

        async fn find_by_name(&self, name: &str) -> Result<Option<PodHandle>, GpuProviderError> {
            Ok(self
                .pods
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, pod)| pod.clone()))
        }

        async fn download_file(
            &self,
            _pod: &PodHandle,
            _remote_path: &str,
        ) -> Result<Vec<u8>, GpuProviderError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_lost_allocate_response_adopts_created_pod() {
        let provider = RetryingProvider::new(
            LossyProvider {
                lost: 1,
                ..LossyProvider::default()
            },
            RetryPolicy::immediate(3),
        );

        let pod = provider
            .allocate("NVIDIA_A100", &PodSpec::new("forge-job-1"))
            .await
            .unwrap();

        assert_eq!(pod, PodHandle::new("pod-0", "NVIDIA_A100"));
        assert_eq!(provider.inner().deploys.load(Ordering::SeqCst), 1);
        assert_eq!(provider.inner().pods.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_response_on_last_attempt_still_adopts() {
        let provider = RetryingProvider::new(
            LossyProvider {
                lost: 5,
                ..LossyProvider::default()
            },
            RetryPolicy::immediate(1),
        );

        let pod = provider
            .allocate("NVIDIA_L4", &PodSpec::new("forge-job-2"))
            .await
            .unwrap();
        assert_eq!(pod.id, "pod-0");
        assert_eq!(provider.inner().deploys.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_total_backoff() {
        let policy = RetryPolicy::default();
        // 2 + 4 + 8 + 16 between five attempts.
        assert_eq!(policy.total_backoff(), Duration::from_secs(30));
        assert_eq!(RetryPolicy::immediate(4).total_backoff(), Duration::ZERO);
    }

    #[test]
    fn test_retry_delays() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = RetryPolicy::immediate(5)
            .run("op", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GpuProviderError::Api {
                        status: 502,
                        message: "bad gateway".into(),
                    })
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("op", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(GpuProviderError::Capacity {
                    gpu_type: "NVIDIA_L4".into(),
                    message: "sold out".into(),
                })
            })
            .await;

        assert!(result.unwrap_err().is_capacity());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_reported() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = RetryPolicy::immediate(3)
            .run("op", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(GpuProviderError::Timeout(30))
            })
            .await;

        match result {
            Err(GpuProviderError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, GpuProviderError::Timeout(30)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
