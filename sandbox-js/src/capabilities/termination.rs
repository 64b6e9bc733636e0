//! Termination guard
//!
//! Every way a script can end itself (`close`, `exit`, `terminate`,
//! `self.close` and the `process` exits) goes through one [`TerminationGuard`].
//! Closing posts the `complete` notice, closes the channel and raises the
//! flag the worker's interrupt handler watches.

use rquickjs::function::Opt;
use rquickjs::{Ctx, Function, Value};
use sandbox_core::domain::message::{CLOSING_NOTICE, MessageType};
use serde_json::Value as JsonValue;
use std::cell::Cell;
use std::rc::Rc;

use crate::capability::{Capability, CapabilityMetadata};
use crate::channel::Channel;
use crate::util;

/// Shared close switch for one job
#[derive(Clone)]
pub struct TerminationGuard {
    channel: Channel,
    closed: Rc<Cell<bool>>,
}

impl TerminationGuard {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            closed: Rc::new(Cell::new(false)),
        }
    }

    /// Closes the job
    ///
    /// Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.get() {
            return;
        }
        self.channel
            .post(MessageType::Complete, JsonValue::String(CLOSING_NOTICE.to_string()));
        self.channel.close();
        self.closed.set(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Handle to the flag, for the interrupt handler
    pub fn flag(&self) -> Rc<Cell<bool>> {
        self.closed.clone()
    }

    /// Creates a native function that closes the guard
    pub(crate) fn close_function<'js>(&self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Function<'js>> {
        let guard = self.clone();
        let function = Function::new(ctx.clone(), move |_code: Opt<Value<'js>>| {
            guard.close();
        })?;
        function.set_name(name)?;
        Ok(function)
    }
}

pub struct TerminationCapability {
    guard: TerminationGuard,
}

impl TerminationCapability {
    pub fn new(guard: TerminationGuard) -> Self {
        Self { guard }
    }
}

impl Capability for TerminationCapability {
    fn id(&self) -> &'static str {
        "termination"
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let globals = ctx.globals();

        for name in ["close", "exit", "terminate"] {
            let function = self.guard.close_function(ctx, name)?;
            util::freeze(ctx, &function)?;
            util::define_locked(&globals, name, function)?;
        }
        util::define_locked(&globals, "self", globals.clone())
    }

    fn declarations(&self) -> String {
        r#"/** Ends the job. Output posted after this call is dropped. */
declare function close(): void;
/** Ends the job. The exit code is ignored. */
declare function exit(code?: number): void;
/** Ends the job. */
declare function terminate(): void;
declare const self: typeof globalThis;
"#
        .to_string()
    }

    fn metadata(&self) -> CapabilityMetadata {
        CapabilityMetadata {
            id: self.id(),
            version: "1.0.0",
            description: "Self-initiated shutdown",
        }
    }
}
