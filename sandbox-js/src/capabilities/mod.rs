//! Capability shims installed into every sandbox
//!
//! Each shim replaces an ambient API a script may expect with a restricted,
//! frozen version. The worker registers them in a fixed order: env, console,
//! process, termination, failures, fs, modules, timers, fetch and, for
//! testing jobs, the test harness.

pub mod console;
pub mod env;
pub mod failure;
pub mod fetch;
pub mod fs;
pub mod modules;
pub mod process;
pub mod termination;
pub mod testing;
pub mod timers;

use sandbox_core::domain::env::EnvSnapshot;

use crate::capability::CapabilityRegistry;
use crate::channel::{Channel, MemorySink};

pub use console::ConsoleCapability;
pub use env::EnvCapability;
pub use failure::{FailureCapability, FailureHandlers};
pub use fetch::{CompletedFetch, FetchCapability, FetchQueue};
pub use fs::{FsCapability, FsError, ScopedFs};
pub use modules::{BuiltinModules, ModuleCapability};
pub use process::ProcessCapability;
pub use termination::{TerminationCapability, TerminationGuard};
pub use testing::{TestHarness, TestingCapability};
pub use timers::{DueTimer, TimerCapability, TimerQueue};

/// TypeScript declarations of everything a script can reach
///
/// Built from an unattached registry in install order, so it always matches
/// what the worker installs. The harness is included for testing jobs only.
pub fn declarations(testing: bool) -> String {
    let channel = Channel::new("declarations", MemorySink::new());
    let guard = TerminationGuard::new(channel.clone());
    let failures = FailureHandlers::new(channel.clone());

    let mut registry = CapabilityRegistry::new();
    registry.register(EnvCapability::new(EnvSnapshot::default()));
    registry.register(ConsoleCapability::new(channel.clone()));
    registry.register(ProcessCapability::new(
        EnvSnapshot::default(),
        "/",
        channel.clone(),
        guard.clone(),
    ));
    registry.register(TerminationCapability::new(guard));
    registry.register(FailureCapability::new(failures.clone()));
    registry.register(FsCapability::new("/"));
    registry.register(ModuleCapability);
    registry.register(TimerCapability::new(TimerQueue::new(), failures.clone()));
    registry.register(FetchCapability::new(FetchQueue::new(), false));
    if testing {
        registry.register(TestingCapability::new(TestHarness::new(), channel, failures));
    }
    registry.generate_declarations()
}
