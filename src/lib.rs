//! Generation job client library
//!
//! Modules:
//! - `client`: `JobClient`, which drives one generation job from submission
//!   to a single terminal outcome.
//! - `tracker`: the current-job state machine (grace window, job-id guard).
//! - `backend`: the backend contract and its HTTP/WebSocket implementation.
//! - `events`: progress-channel frame parsing.
//! - `request`: generation request builder.
//! - `state`: caller-visible job state and images.
//! - `retry`: backoff for the result-fetch fallback.
//! - `config`: Env-driven configuration loader.
//! - `error`: Common error type and alias.
//!
//! Re-exports are provided for common types: `Config`, `JobClient`,
//! `HttpBackend`, `GenerationRequest`, and `JobState`.
pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod request;
pub mod retry;
pub mod state;
pub mod tracker;

pub use backend::{GenerationBackend, HttpBackend};
pub use client::{JobClient, JobHandle};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use request::{GenerationRequest, Seed};
pub use state::{GeneratedImage, JobSnapshot, JobState};
