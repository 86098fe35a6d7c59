//! GPU provider trait and common types.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during GPU provider operations.
#[derive(Error, Debug)]
pub enum GpuProviderError {
    /// HTTP request failed (connect, TLS, body read, per-call timeout).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// The provider has no capacity for the requested GPU type.
    #[error("No capacity for GPU type {gpu_type}: {message}")]
    Capacity { gpu_type: String, message: String },

    /// The provider rejected the request as invalid (template, GPU id, input).
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Operation timed out.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Retries were exhausted on a transient failure.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<GpuProviderError>,
    },
}

impl GpuProviderError {
    /// Whether the failure is worth retrying.
    ///
    /// Network failures, timeouts, HTTP 5xx and 429 are transient. Capacity
    /// exhaustion, invalid templates and other 4xx responses are permanent.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Timeout(_) => true,
            Self::Capacity { .. }
            | Self::Invalid(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::RetriesExhausted { .. } => false,
        }
    }

    /// Whether the provider reported that no GPUs of the requested type are free.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        match self {
            Self::Capacity { .. } => true,
            Self::RetriesExhausted { last, .. } => last.is_capacity(),
            _ => false,
        }
    }
}

/// Observed lifecycle state of a training pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodStatus {
    /// Pod is scheduled or the container is still starting.
    Starting,
    /// The training container is running.
    Running,
    /// The training container exited successfully.
    Completed,
    /// The pod or container failed.
    Errored,
    /// Provider could not tell (pod missing, unrecognised state).
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for PodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Errored => write!(f, "errored"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Reference to an allocated pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodHandle {
    /// Provider pod identifier.
    pub id: String,
    /// GPU type the pod was allocated on.
    pub gpu_type: String,
}

impl PodHandle {
    /// Create a new pod handle.
    #[must_use]
    pub fn new(id: impl Into<String>, gpu_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            gpu_type: gpu_type.into(),
        }
    }
}

impl std::fmt::Display for PodHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.id, self.gpu_type)
    }
}

/// What to run on a newly allocated pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    /// Pod name. Unique per job so an orphaned allocation can be found again.
    pub name: String,
    /// Environment handed to the training container.
    pub env: BTreeMap<String, String>,
    /// Container disk in GB.
    pub container_disk_gb: u32,
    /// Network volume in GB (0 for none).
    pub volume_gb: u32,
}

impl PodSpec {
    /// Create a spec with the given pod name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            env: BTreeMap::new(),
            container_disk_gb: 50,
            volume_gb: 0,
        }
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Trait for GPU rental providers.
///
/// Implementations only map requests and responses; deciding what to do with
/// a failure is left to the caller.
#[async_trait]
pub trait GpuProvider: Send + Sync {
    /// Allocate a pod on the given GPU type.
    async fn allocate(&self, gpu_type: &str, spec: &PodSpec)
        -> Result<PodHandle, GpuProviderError>;

    /// Poll the current status of a pod.
    async fn poll_status(&self, pod: &PodHandle) -> Result<PodStatus, GpuProviderError>;

    /// Terminate a pod. A pod that no longer exists counts as terminated.
    async fn terminate(&self, pod: &PodHandle) -> Result<(), GpuProviderError>;

    /// Look up a live pod by name.
    async fn find_by_name(&self, name: &str) -> Result<Option<PodHandle>, GpuProviderError>;

    /// Fetch a file from the pod's filesystem.
    async fn download_file(
        &self,
        pod: &PodHandle,
        remote_path: &str,
    ) -> Result<Vec<u8>, GpuProviderError>;
}
