//! Asynchronous job execution core for audio transcription: durable
//! owner-scoped job state, retry policy and circuit breaking around an
//! unreliable transcription engine, dual-mode dispatch (worker pool or
//! inline), and per-owner real-time fan-out of lifecycle events.

pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod notify;

pub use config::{Config, ExecutionMode};
pub use error::JobError;
