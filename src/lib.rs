//! Lifecycle engine for asynchronous translation jobs.
//!
//! Jobs move through a guarded state machine ([`state_machine`]), failures are
//! retried through a dead-letter queue with backoff ([`dlq`]), status changes are
//! pushed to per-job subscribers ([`registry`]) and status reads are served from
//! a TTL cache ([`cache`]). [`engine::JobEngine`] ties them together.

pub mod api;
pub mod cache;
pub mod config;
pub mod dlq;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod poller;
pub mod registry;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod telemetry;
pub mod translator;
pub mod ui;

pub use engine::{EngineBuilder, JobEngine, RecoveryReport};
pub use error::{EngineError, PollError, StoreError, TranslateError};
pub use state_machine::{Job, JobId, JobSnapshot, JobStatus};
