//! Orchestrator error taxonomy.

use forge_gpu::GpuProviderError;
use forge_payments::{PaymentError, SignatureError};
use thiserror::Error;

use crate::artifacts::ArtifactError;
use crate::model::{JobId, JobStatus};
use crate::store::StoreError;

/// Errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed request; rejected before any state change.
    #[error("validation error: {0}")]
    Validation(String),

    /// Every preferred GPU type was out of capacity.
    #[error("no capacity for GPU types: {0}")]
    Capacity(String),

    /// A provider call failed transiently and may succeed later.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// A webhook delivery failed verification.
    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    /// The record changed between read and commit.
    #[error("job {job_id} changed concurrently")]
    StaleStateConflict { job_id: JobId },

    /// The pod could not be terminated; it will be retried.
    #[error("teardown of pod {pod_id} failed: {message}")]
    Teardown { pod_id: String, message: String },

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// A write would break a record invariant.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),

    #[error("store error: {0}")]
    Store(String),

    #[error("payment gateway error: {0}")]
    Payment(#[from] PaymentError),

    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Permanent provider failure.
    #[error("GPU provider error: {0}")]
    Provider(String),
}

impl OrchestratorError {
    /// Whether the error is the optimistic check losing a race.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StaleStateConflict { .. })
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { job_id } => Self::StaleStateConflict { job_id },
            StoreError::NotFound(job_id) => Self::NotFound(job_id),
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<GpuProviderError> for OrchestratorError {
    fn from(err: GpuProviderError) -> Self {
        if err.is_capacity() {
            Self::Capacity(err.to_string())
        } else if err.is_transient() || matches!(err, GpuProviderError::RetriesExhausted { .. }) {
            Self::Transient(err.to_string())
        } else {
            Self::Provider(err.to_string())
        }
    }
}

/// Result alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_conflict_maps_to_stale_state() {
        let id = JobId::new();
        let err: OrchestratorError = StoreError::Conflict { job_id: id }.into();
        assert!(err.is_conflict());

        let err: OrchestratorError = StoreError::NotFound(id).into();
        assert!(matches!(err, OrchestratorError::NotFound(found) if found == id));
    }

    #[test]
    fn test_provider_error_classification() {
        let capacity = GpuProviderError::Capacity {
            gpu_type: "NVIDIA_L4".into(),
            message: "sold out".into(),
        };
        assert!(matches!(
            OrchestratorError::from(capacity),
            OrchestratorError::Capacity(_)
        ));

        let exhausted = GpuProviderError::RetriesExhausted {
            attempts: 5,
            last: Box::new(GpuProviderError::Timeout(30)),
        };
        assert!(matches!(
            OrchestratorError::from(exhausted),
            OrchestratorError::Transient(_)
        ));

        let invalid = GpuProviderError::Invalid("bad template".into());
        assert!(matches!(
            OrchestratorError::from(invalid),
            OrchestratorError::Provider(_)
        ));
    }
}
