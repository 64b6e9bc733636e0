//! Sandbox JavaScript Infrastructure
//!
//! This crate provides the script-facing half of the sandbox:
//! - Capability trait and registry
//! - The capability shims (console, process, env, termination, timers, fs,
//!   fetch, ...)
//! - The worker side of the message channel
//! - Sandbox creation over QuickJS with memory and stack limits
//! - Error serialization for thrown values and rejections

pub mod capabilities;
pub mod capability;
pub mod channel;
pub mod errors;
pub mod sandbox;
pub mod util;

pub use capabilities::{
    ConsoleCapability, EnvCapability, FailureCapability, FailureHandlers, FetchCapability,
    FetchQueue, FsCapability, ModuleCapability, ProcessCapability, TerminationCapability,
    TerminationGuard, TestHarness, TestingCapability, TimerCapability, TimerQueue, declarations,
};
pub use capability::{Capability, CapabilityMetadata, CapabilityRegistry};
pub use channel::{Channel, MemorySink, MessageSink};
pub use errors::{ErrorOrigin, SandboxError, serialize_error};
pub use sandbox::{InstallReport, Sandbox};
