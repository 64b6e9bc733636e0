//! QuickJS sandbox creation
//!
//! A [`Sandbox`] is a fresh runtime with memory and stack limits and a
//! single context. QuickJS ships no I/O of its own, so the context starts
//! with nothing but the language intrinsics; everything a script can reach
//! beyond that comes from the capabilities installed through
//! [`Sandbox::install`].

use rquickjs::{Context, Runtime};
use sandbox_core::protocol::ResourceLimits;
use tracing::{debug, warn};

use crate::capability::CapabilityRegistry;
use crate::errors::{SandboxError, describe};

/// Outcome of installing a registry
#[derive(Debug, Default)]
pub struct InstallReport {
    pub installed: Vec<&'static str>,
    pub failed: Vec<SandboxError>,
}

impl InstallReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Sandbox {
    // Dropped before the runtime
    context: Context,
    runtime: Runtime,
}

impl Sandbox {
    /// Creates a restricted runtime and context
    ///
    /// # Example
    /// ```no_run
    /// use sandbox_core::protocol::ResourceLimits;
    /// use sandbox_js::Sandbox;
    ///
    /// let sandbox = Sandbox::new(&ResourceLimits::default())?;
    /// let sum: i32 = sandbox.context().with(|ctx| ctx.eval("1 + 2"))?;
    /// assert_eq!(sum, 3);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(limits: &ResourceLimits) -> Result<Self, SandboxError> {
        let runtime = Runtime::new().map_err(SandboxError::Runtime)?;
        runtime.set_memory_limit(limits.memory_limit_bytes);
        runtime.set_max_stack_size(limits.max_stack_bytes);

        let context = Context::full(&runtime).map_err(SandboxError::Context)?;
        Ok(Self { context, runtime })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Installs every capability of the registry, in order
    ///
    /// Runtime hooks are attached first, then globals are installed. A
    /// capability that fails at either step is skipped and logged; the rest
    /// are still installed.
    pub fn install(&self, registry: &CapabilityRegistry) -> InstallReport {
        let mut report = InstallReport::default();
        let mut attached = Vec::new();

        for capability in registry.capabilities() {
            match capability.attach(&self.runtime) {
                Ok(()) => attached.push(capability),
                Err(err) => {
                    warn!("capability '{}' failed to attach: {}", capability.id(), err);
                    report.failed.push(SandboxError::Install {
                        id: capability.id(),
                        message: err.to_string(),
                    });
                }
            }
        }

        self.context.with(|ctx| {
            for capability in attached {
                match capability.install(&ctx) {
                    Ok(()) => {
                        debug!("installed capability '{}'", capability.id());
                        report.installed.push(capability.id());
                    }
                    Err(err) => {
                        let message = describe(&ctx, err);
                        warn!("capability '{}' failed to install: {}", capability.id(), message);
                        report.failed.push(SandboxError::Install {
                            id: capability.id(),
                            message,
                        });
                    }
                }
            }
        });

        report
    }
}
