//! GPU pod provisioning for LoRA training jobs.
//!
//! This crate is the thin client layer between the job orchestrator and the
//! GPU rental provider. It maps requests and responses, classifies failures as
//! transient or permanent, and retries transient failures with bounded
//! exponential backoff. It makes no decisions about jobs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    allocate / poll_status / terminate    ┌──────────────┐
//! │  Job             │ ───────────────────────────────────────► │ RetryingPro- │
//! │  Orchestrator    │                                          │ vider<P>     │
//! └──────────────────┘                                          └──────┬───────┘
//!                                                                      │ transient
//!                                                                      │ errors only
//!                                                                      ▼
//!                                                               ┌──────────────┐
//!                                                               │ RunPod       │
//!                                                               │ (GraphQL)    │
//!                                                               └──────────────┘
//! ```
//!
//! ## Supported Providers
//!
//! - **RunPod** - on-demand pods (L4, A10G, A100, ...) deployed from a template
//!
//! ## Example
//!
//! ```ignore
//! use forge_gpu::providers::runpod::RunPod;
//! use forge_gpu::{GpuProvider, PodSpec, RetryPolicy, RetryingProvider};
//!
//! let provider = RetryingProvider::new(RunPod::new(api_key, template_id)?, RetryPolicy::default());
//! let pod = provider.allocate("NVIDIA_A10G", &PodSpec::new("forge-1234")).await?;
//! provider.terminate(&pod).await?;
//! ```

pub mod providers;
pub mod retry;

pub use providers::runpod;
pub use providers::traits::{
    GpuProvider, GpuProviderError, PodHandle, PodSpec, PodStatus,
};
pub use retry::{RetryPolicy, RetryingProvider};
