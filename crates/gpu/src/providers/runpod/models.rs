//! RunPod GraphQL API models.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// GraphQL envelope
// ============================================================================

/// GraphQL request body.
#[derive(Debug, Serialize)]
pub struct GraphQlRequest<'a> {
    /// Query or mutation document.
    pub query: &'a str,
    /// Variables.
    pub variables: Value,
}

/// GraphQL response wrapper.
#[derive(Debug, Deserialize)]
pub struct GraphQlResponse<T> {
    /// Response data (absent when the whole request failed).
    pub data: Option<T>,
    /// Errors reported by the API.
    #[serde(default)]
    pub errors: Vec<GraphQlError>,
}

/// A single GraphQL error.
#[derive(Debug, Deserialize)]
pub struct GraphQlError {
    /// Error message.
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Deploy
// ============================================================================

/// Input for `podFindAndDeployOnDemand`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployInput {
    /// `SECURE` or `COMMUNITY`.
    pub cloud_type: String,
    /// GPU type identifier (e.g. `NVIDIA_L4`).
    pub gpu_type_id: String,
    /// Number of GPUs.
    pub gpu_count: u32,
    /// Pod template id.
    pub template_id: String,
    /// Pod name.
    pub name: String,
    /// Network volume size in GB.
    pub volume_in_gb: u32,
    /// Container disk size in GB.
    pub container_disk_in_gb: u32,
    /// Environment variables.
    pub env: Vec<EnvVar>,
}

/// Environment variable entry.
#[derive(Debug, Serialize)]
pub struct EnvVar {
    /// Variable name.
    pub key: String,
    /// Variable value.
    pub value: String,
}

/// Data returned by the deploy mutation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployData {
    /// Deployed pod.
    pub pod_find_and_deploy_on_demand: Option<PodRef>,
}

/// Minimal pod reference.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRef {
    /// Pod id.
    pub id: String,
    /// Pod name.
    #[serde(default)]
    pub name: Option<String>,
    /// Machine GPU type, when returned.
    #[serde(default)]
    pub machine: Option<Machine>,
    /// Desired status (`RUNNING`, `EXITED`, `TERMINATED`).
    #[serde(default)]
    pub desired_status: Option<String>,
}

/// Machine details.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    /// GPU type id.
    #[serde(default)]
    pub gpu_type_id: Option<String>,
}

// ============================================================================
// Status
// ============================================================================

/// Data returned by the pod status query.
#[derive(Debug, Deserialize)]
pub struct PodStatusData {
    /// Pod (null when it no longer exists).
    pub pod: Option<PodDetails>,
}

/// Pod details for status mapping.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodDetails {
    /// Pod id.
    pub id: String,
    /// Desired status set on the pod.
    #[serde(default)]
    pub desired_status: Option<String>,
    /// Runtime information (null while the container is not up).
    #[serde(default)]
    pub runtime: Option<PodRuntime>,
}

/// Pod runtime.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRuntime {
    /// Runtime state reported by the container agent.
    #[serde(default)]
    pub state: Option<String>,
    /// Uptime in seconds.
    #[serde(default)]
    pub uptime_in_seconds: Option<u64>,
}

// ============================================================================
// Listing
// ============================================================================

/// Data returned by the `myself { pods }` query.
#[derive(Debug, Deserialize)]
pub struct MyselfData {
    /// Account.
    pub myself: Option<Myself>,
}

/// Account with pods.
#[derive(Debug, Deserialize)]
pub struct Myself {
    /// Pods owned by the account.
    #[serde(default)]
    pub pods: Vec<PodRef>,
}

// ============================================================================
// Files
// ============================================================================

/// Data returned by the `podDownloadFile` query.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadData {
    /// Base64 file contents.
    pub pod_download_file: Option<String>,
}
