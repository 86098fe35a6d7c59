//! RunPod GPU provider.
//!
//! Implements the [`GpuProvider`](crate::GpuProvider) trait against the RunPod
//! GraphQL API. Pods are deployed on demand from a template that contains the
//! training image; the job configuration travels as container environment.
//!
//! ## Example
//!
//! ```ignore
//! use forge_gpu::providers::runpod::RunPod;
//! use forge_gpu::{GpuProvider, PodSpec};
//!
//! let provider = RunPod::new(api_key, template_id)?;
//! let pod = provider
//!     .allocate("NVIDIA_L4", &PodSpec::new("forge-job-1").with_env("STEPS", "2000"))
//!     .await?;
//! let status = provider.poll_status(&pod).await?;
//! provider.terminate(&pod).await?;
//! ```

mod client;
mod models;

pub use client::{RunPod, API_URL};
