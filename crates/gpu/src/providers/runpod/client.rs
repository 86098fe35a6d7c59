//! RunPod GraphQL API client implementation.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use super::models::{
    DeployData, DeployInput, DownloadData, EnvVar, GraphQlRequest, GraphQlResponse, MyselfData, PodDetails,
    PodStatusData,
};
use crate::providers::traits::{GpuProvider, GpuProviderError, PodHandle, PodSpec, PodStatus};

/// Default GraphQL endpoint.
pub const API_URL: &str = "https://api.runpod.io/graphql";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Substring RunPod uses when a GPU type is sold out.
const CAPACITY_MARKER: &str = "no longer any instances available";

const DEPLOY_MUTATION: &str = r"
mutation Deploy($input: PodFindAndDeployOnDemandInput!) {
  podFindAndDeployOnDemand(input: $input) {
    id
    name
    machine { gpuTypeId }
  }
}";

const STATUS_QUERY: &str = r"
query PodStatus($podId: String!) {
  pod(input: { podId: $podId }) {
    id
    desiredStatus
    runtime { state uptimeInSeconds }
  }
}";

const TERMINATE_MUTATION: &str = r"
mutation PodTerminate($podId: String!) {
  podTerminate(input: { podId: $podId })
}";

const LIST_QUERY: &str = r"
query Pods {
  myself {
    pods { id name desiredStatus machine { gpuTypeId } }
  }
}";

const DOWNLOAD_QUERY: &str = r"
query PodDownload($podId: ID!, $path: String!) {
  podDownloadFile(podId: $podId, path: $path)
}";

/// RunPod GPU provider.
#[derive(Clone)]
pub struct RunPod {
    /// HTTP client.
    client: Client,
    /// API key for authentication.
    api_key: String,
    /// GraphQL endpoint.
    api_url: String,
    /// Pod template with the training image.
    template_id: String,
    /// `SECURE` or `COMMUNITY`.
    cloud_type: String,
}

impl RunPod {
    /// Create a new RunPod provider.
    ///
    /// # Errors
    /// Returns error if credentials are missing or the HTTP client cannot be created.
    pub fn new(
        api_key: impl Into<String>,
        template_id: impl Into<String>,
    ) -> Result<Self, GpuProviderError> {
        Self::with_options(api_key, template_id, API_URL, DEFAULT_TIMEOUT_SECS)
    }

    /// Create a provider against a custom endpoint with a per-call timeout.
    ///
    /// # Errors
    /// Returns error if credentials are missing or the HTTP client cannot be created.
    pub fn with_options(
        api_key: impl Into<String>,
        template_id: impl Into<String>,
        api_url: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, GpuProviderError> {
        let api_key = api_key.into();
        let template_id = template_id.into();
        if api_key.trim().is_empty() {
            return Err(GpuProviderError::Config("RunPod API key is empty".into()));
        }
        if template_id.trim().is_empty() {
            return Err(GpuProviderError::Config(
                "RunPod pod template id is empty".into(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            api_url: api_url.into(),
            template_id,
            cloud_type: "SECURE".to_string(),
        })
    }

    /// Use the community cloud instead of the secure cloud.
    #[must_use]
    pub fn community_cloud(mut self) -> Self {
        self.cloud_type = "COMMUNITY".to_string();
        self
    }

    /// Run a GraphQL document and return its `data`.
    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, GpuProviderError> {
        debug!(url = %self.api_url, "GraphQL request");

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&GraphQlRequest { query, variables })
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(GpuProviderError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let parsed: GraphQlResponse<T> = serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, body = %text, "Failed to parse response");
            GpuProviderError::Serialization(e)
        })?;

        if !parsed.errors.is_empty() {
            let message = parsed
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(GpuProviderError::Invalid(message));
        }

        parsed
            .data
            .ok_or_else(|| GpuProviderError::Invalid("response carried no data".into()))
    }

    /// Map RunPod's desired status and runtime state onto [`PodStatus`].
    fn to_pod_status(details: Option<&PodDetails>) -> PodStatus {
        let Some(pod) = details else {
            return PodStatus::Unknown;
        };

        let runtime_state = pod
            .runtime
            .as_ref()
            .and_then(|r| r.state.as_deref())
            .map(str::to_ascii_uppercase);

        match runtime_state.as_deref() {
            Some("RUNNING") => return PodStatus::Running,
            Some("COMPLETED" | "SUCCEEDED" | "EXITED") => return PodStatus::Completed,
            Some("FAILED" | "CANCELLED" | "ERROR") => return PodStatus::Errored,
            _ => {}
        }

        match pod.desired_status.as_deref() {
            Some("RUNNING" | "CREATED") => PodStatus::Starting,
            Some("EXITED") => PodStatus::Completed,
            Some("TERMINATED") => PodStatus::Errored,
            _ => PodStatus::Unknown,
        }
    }
}

#[async_trait]
impl GpuProvider for RunPod {
    async fn allocate(
        &self,
        gpu_type: &str,
        spec: &PodSpec,
    ) -> Result<PodHandle, GpuProviderError> {
        info!(gpu_type = %gpu_type, name = %spec.name, "Allocating pod");

        let input = DeployInput {
            cloud_type: self.cloud_type.clone(),
            gpu_type_id: gpu_type.to_string(),
            gpu_count: 1,
            template_id: self.template_id.clone(),
            name: spec.name.clone(),
            volume_in_gb: spec.volume_gb,
            container_disk_in_gb: spec.container_disk_gb,
            env: spec
                .env
                .iter()
                .map(|(key, value)| EnvVar {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        };

        let data: DeployData = match self
            .graphql(DEPLOY_MUTATION, json!({ "input": input }))
            .await
        {
            Ok(data) => data,
            Err(GpuProviderError::Invalid(message))
                if message.to_lowercase().contains(CAPACITY_MARKER) =>
            {
                return Err(GpuProviderError::Capacity {
                    gpu_type: gpu_type.to_string(),
                    message,
                });
            }
            Err(e) => return Err(e),
        };

        let pod = data.pod_find_and_deploy_on_demand.ok_or_else(|| {
            GpuProviderError::Invalid("deploy response did not include a pod".into())
        })?;

        info!(pod_id = %pod.id, gpu_type = %gpu_type, "Pod allocated");
        Ok(PodHandle::new(pod.id, gpu_type))
    }

    async fn poll_status(&self, pod: &PodHandle) -> Result<PodStatus, GpuProviderError> {
        let data: PodStatusData = self
            .graphql(STATUS_QUERY, json!({ "podId": pod.id }))
            .await?;
        let status = Self::to_pod_status(data.pod.as_ref());
        debug!(pod_id = %pod.id, status = %status, "Polled pod status");
        Ok(status)
    }

    async fn terminate(&self, pod: &PodHandle) -> Result<(), GpuProviderError> {
        info!(pod_id = %pod.id, "Terminating pod");
        match self
            .graphql::<serde_json::Value>(TERMINATE_MUTATION, json!({ "podId": pod.id }))
            .await
        {
            Ok(_) => {}
            Err(GpuProviderError::Invalid(message))
                if message.to_lowercase().contains("not found") =>
            {
                debug!(pod_id = %pod.id, "Pod already gone");
            }
            Err(e) => return Err(e),
        }
        info!(pod_id = %pod.id, "Pod terminated");
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<PodHandle>, GpuProviderError> {
        let data: MyselfData = self.graphql(LIST_QUERY, json!({})).await?;
        let pods = data.myself.map(|m| m.pods).unwrap_or_default();

        Ok(pods
            .into_iter()
            .filter(|p| p.desired_status.as_deref() != Some("TERMINATED"))
            .find(|p| p.name.as_deref() == Some(name))
            .map(|p| {
                let gpu_type = p
                    .machine
                    .and_then(|m| m.gpu_type_id)
                    .unwrap_or_default();
                PodHandle::new(p.id, gpu_type)
            }))
    }

    async fn download_file(
        &self,
        pod: &PodHandle,
        remote_path: &str,
    ) -> Result<Vec<u8>, GpuProviderError> {
        let data: DownloadData = self
            .graphql(DOWNLOAD_QUERY, json!({ "podId": pod.id, "path": remote_path }))
            .await?;
        let encoded = data
            .pod_download_file
            .filter(|e| !e.is_empty())
            .ok_or_else(|| GpuProviderError::Invalid(format!("no data returned for {remote_path}")))?;

        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| GpuProviderError::Invalid(format!("bad file encoding for {remote_path}: {e}")))?;
        info!(pod_id = %pod.id, path = %remote_path, bytes = bytes.len(), "Downloaded file");
        Ok(bytes)
    }
}
