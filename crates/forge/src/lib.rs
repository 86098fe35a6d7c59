//! LoRA training job orchestration.
//!
//! Turns a paid training request into a running GPU pod, tracks it through
//! unreliable provider and payment signals, and settles teardown, artifacts
//! and refunds whatever happens.
//!
//! ## Architecture
//!
//! ```text
//!  user API ─────┐
//!  payment hooks ├──► Orchestrator ──► JobStore (compare-and-swap)
//!  pod callbacks ┘        │  ▲
//!                         │  └──── Reconciler (interval, polls)
//!                         ▼
//!          GpuProvider · PaymentGateway · ArtifactStore
//! ```
//!
//! Every state change goes through the orchestrator's transition primitive,
//! so pushes (webhooks, callbacks) and polls (reconciliation) converge on the
//! same idempotent logic.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pricing;
pub mod reconcile;
pub mod server;
pub mod store;
pub mod training;

pub use artifacts::{ArtifactError, ArtifactSource, ArtifactStore, FsArtifactStore};
pub use config::{Config, ConfigError};
pub use error::OrchestratorError;
pub use model::{
    FailureReason, JobEvent, JobId, JobRecord, JobStatus, JobView, OrderStatus, OwnerId,
    PaymentOrder, TrainingJob,
};
pub use orchestrator::{Orchestrator, PaymentOutcome, ProvisionOutcome};
pub use reconcile::{ReconcileReport, Reconciler};
pub use store::{FileStore, JobStore, MemoryStore, StoreError};
pub use training::SubmitJob;
