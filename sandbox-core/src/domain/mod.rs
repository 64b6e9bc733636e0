//! Core domain types
//!
//! These types are shared between the orchestrator (which supervises jobs)
//! and the worker (which produces messages while running a script).

pub mod env;
pub mod error;
pub mod job;
pub mod message;
