//! Persisting trained model artifacts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::model::{ArtifactReference, JobId};

/// Artifact store errors.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no weights were produced for job {0}")]
    Empty(JobId),
}

/// Where to collect a finished model from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSource {
    pub pod_id: String,
    pub gpu_type: String,
    /// Path of the weights on the pod.
    pub remote_path: String,
    /// When the provider reported success. Fixes the storage location.
    pub collected_at: DateTime<Utc>,
}

/// Durable storage for trained models.
///
/// `store` must be idempotent per job: storing twice yields the same reference.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn store(
        &self,
        job_id: JobId,
        source: &ArtifactSource,
        weights: &[u8],
    ) -> Result<ArtifactReference, ArtifactError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    job_id: JobId,
    #[serde(flatten)]
    source: ArtifactSource,
    /// File name of the weights, next to the manifest.
    weights: String,
    size_bytes: u64,
    stored_at: DateTime<Utc>,
}

/// Writes weights and a manifest under `<root>/YYYY/MM/DD/<job_id>.{safetensors,json}`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, at: DateTime<Utc>) -> PathBuf {
        self.root.join(at.format("%Y/%m/%d").to_string())
    }

    fn reference(path: &Path, size_bytes: u64) -> ArtifactReference {
        ArtifactReference {
            uri: format!("file://{}", path.display()),
            size_bytes,
        }
    }
}

/// Write through a temporary file so readers never see a partial file.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ArtifactError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn store(
        &self,
        job_id: JobId,
        source: &ArtifactSource,
        weights: &[u8],
    ) -> Result<ArtifactReference, ArtifactError> {
        if weights.is_empty() {
            return Err(ArtifactError::Empty(job_id));
        }
        let dir = self.dir(source.collected_at);
        let weights_name = format!("{job_id}.safetensors");
        let weights_path = dir.join(&weights_name);
        let manifest_path = dir.join(format!("{job_id}.json"));

        // The manifest is written last, so its presence means the weights are complete.
        if tokio::fs::try_exists(&manifest_path).await? {
            let manifest: Manifest = serde_json::from_slice(&tokio::fs::read(&manifest_path).await?)?;
            return Ok(Self::reference(&weights_path, manifest.size_bytes));
        }
        tokio::fs::create_dir_all(&dir).await?;

        let size_bytes = weights.len() as u64;
        write_atomic(&weights_path, weights).await?;
        let manifest = Manifest {
            job_id,
            source: source.clone(),
            weights: weights_name,
            size_bytes,
            stored_at: Utc::now(),
        };
        write_atomic(&manifest_path, &serde_json::to_vec_pretty(&manifest)?).await?;

        let reference = Self::reference(&weights_path, size_bytes);
        info!(job_id = %job_id, uri = %reference.uri, size_bytes, "Artifact stored");
        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn source(job_id: JobId) -> ArtifactSource {
        ArtifactSource {
            pod_id: "pod-1".into(),
            gpu_type: "NVIDIA_L4".into(),
            remote_path: format!("/workspace/output/{job_id}/{job_id}.safetensors"),
            collected_at: Utc.with_ymd_and_hms(2025, 3, 7, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_store_keeps_weights_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path().join("trained_models"));
        let job_id = JobId::new();
        let source = source(job_id);

        let first = store.store(job_id, &source, b"lora-weights").await.unwrap();
        let second = store.store(job_id, &source, b"other").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.size_bytes, 12);

        let day = dir.path().join("trained_models/2025/03/07");
        let weights = day.join(format!("{job_id}.safetensors"));
        assert!(first.uri.ends_with(&weights.display().to_string()));
        assert_eq!(std::fs::read(&weights).unwrap(), b"lora-weights");

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(day.join(format!("{job_id}.json"))).unwrap())
                .unwrap();
        assert_eq!(manifest["pod_id"], "pod-1");
        assert_eq!(manifest["job_id"], job_id.to_string());
        assert_eq!(manifest["size_bytes"], 12);
        assert_eq!(manifest["weights"], format!("{job_id}.safetensors"));
    }

    #[tokio::test]
    async fn test_empty_weights_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let job_id = JobId::new();

        let err = store.store(job_id, &source(job_id), b"").await.unwrap_err();
        assert!(matches!(err, ArtifactError::Empty(id) if id == job_id));
        assert!(!dir.path().join("2025").exists());
    }
}
