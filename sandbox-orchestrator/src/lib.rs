//! Sandbox Orchestrator
//!
//! Host side of the sandboxed script engine. Jobs are submitted over HTTP
//! or in-process, each runs in its own worker process, and the worker's
//! messages are relayed to the caller as a stream or a buffered report.

pub mod api;
pub mod config;
pub mod service;

pub use config::Config;
pub use service::{JobError, JobOrchestrator, JobStream};
