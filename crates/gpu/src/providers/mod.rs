//! GPU provider implementations.
//!
//! This module contains the [`GpuProvider`] trait and implementations
//! for GPU rental providers.

pub mod runpod;
pub mod traits;

pub use traits::{GpuProvider, GpuProviderError, PodHandle, PodSpec, PodStatus};
