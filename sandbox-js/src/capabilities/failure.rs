//! Uncaught errors and unhandled rejections
//!
//! Synchronous failures are reported by whoever catches them (the worker's
//! executor, the timer loop) through [`FailureHandlers::report_uncaught`].
//! Rejections are tracked through the engine's rejection tracker: a
//! rejection is remembered while nothing handles it and forgotten as soon
//! as a handler is attached. [`FailureHandlers::flush`] reports whatever is
//! still unhandled once the job queue has drained.

use rquickjs::{Ctx, Persistent, Runtime, Value};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

use crate::capability::{Capability, CapabilityMetadata};
use crate::channel::Channel;
use crate::errors::{ErrorOrigin, serialize_error};

type Pending = Vec<(Persistent<Value<'static>>, Persistent<Value<'static>>)>;

#[derive(Clone)]
pub struct FailureHandlers {
    channel: Channel,
    pending: Rc<RefCell<Pending>>,
}

impl FailureHandlers {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            pending: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Posts a thrown value as an `exception` message
    pub fn report_uncaught<'js>(&self, ctx: &Ctx<'js>, thrown: &Value<'js>) {
        let error = serialize_error(ctx, thrown, ErrorOrigin::Uncaught);
        self.channel.post_exception(&error);
    }

    /// Stops tracking a promise whose rejection is reported another way
    pub fn forget<'js>(&self, ctx: &Ctx<'js>, promise: &Value<'js>) {
        let mut pending = self.pending.borrow_mut();
        pending.retain(|(tracked, _)| !same_value(ctx, tracked, promise));
    }

    /// Reports and clears every rejection nobody handled
    pub fn flush<'js>(&self, ctx: &Ctx<'js>) -> usize {
        let drained: Pending = std::mem::take(&mut *self.pending.borrow_mut());
        let count = drained.len();
        for (_, reason) in drained {
            let error = match reason.restore(ctx) {
                Ok(reason) => serialize_error(ctx, &reason, ErrorOrigin::UnhandledRejection),
                Err(err) => {
                    debug!("could not restore rejection reason: {}", err);
                    continue;
                }
            };
            self.channel.post_exception(&error);
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Drops every tracked value
    ///
    /// Must run before the runtime is dropped.
    pub fn clear(&self) {
        self.pending.borrow_mut().clear();
    }
}

fn same_value<'js>(ctx: &Ctx<'js>, tracked: &Persistent<Value<'static>>, value: &Value<'js>) -> bool {
    tracked
        .clone()
        .restore(ctx)
        .map(|tracked| tracked == *value)
        .unwrap_or(false)
}

pub struct FailureCapability {
    handlers: FailureHandlers,
}

impl FailureCapability {
    pub fn new(handlers: FailureHandlers) -> Self {
        Self { handlers }
    }
}

impl Capability for FailureCapability {
    fn id(&self) -> &'static str {
        "failures"
    }

    fn attach(&self, runtime: &Runtime) -> rquickjs::Result<()> {
        let pending = self.handlers.pending.clone();
        runtime.set_host_promise_rejection_tracker(Some(Box::new(
            move |ctx: Ctx<'_>, promise: Value<'_>, reason: Value<'_>, is_handled: bool| {
                let mut pending = pending.borrow_mut();
                if is_handled {
                    pending.retain(|(tracked, _)| !same_value(&ctx, tracked, &promise));
                } else {
                    pending.push((Persistent::save(&ctx, promise), Persistent::save(&ctx, reason)));
                }
            },
        )));
        Ok(())
    }

    fn install<'js>(&self, _ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        Ok(())
    }

    fn declarations(&self) -> String {
        String::new()
    }

    fn metadata(&self) -> CapabilityMetadata {
        CapabilityMetadata {
            id: self.id(),
            version: "1.0.0",
            description: "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemorySink;
    use rquickjs::Context;
    use sandbox_core::domain::message::MessageType;

    fn setup() -> (MemorySink, FailureHandlers, Runtime) {
        let sink = MemorySink::new();
        let handlers = FailureHandlers::new(Channel::new("job", sink.clone()));
        let runtime = Runtime::new().unwrap();
        FailureCapability::new(handlers.clone()).attach(&runtime).unwrap();
        (sink, handlers, runtime)
    }

    fn drain(ctx: &Ctx<'_>) {
        while ctx.execute_pending_job() {}
    }

    #[test]
    fn test_unhandled_rejection_is_reported() {
        let (sink, handlers, runtime) = setup();
        let context = Context::full(&runtime).unwrap();

        context.with(|ctx| {
            ctx.eval::<(), _>("Promise.reject(new Error('nobody cares'))").unwrap();
            drain(&ctx);
            assert_eq!(handlers.flush(&ctx), 1);
        });
        handlers.clear();

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        let error = messages[0].exception().unwrap();
        assert_eq!(error.message, "nobody cares");
        assert!(error.stack.unwrap().starts_with("Unhandled rejection Error: nobody cares"));
    }

    #[test]
    fn test_late_handler_clears_rejection() {
        let (sink, handlers, runtime) = setup();
        let context = Context::full(&runtime).unwrap();

        context.with(|ctx| {
            ctx.eval::<(), _>(
                "const p = Promise.reject('later'); Promise.resolve().then(() => p.catch(() => {}));",
            )
            .unwrap();
            drain(&ctx);
            assert_eq!(handlers.flush(&ctx), 0);
        });
        handlers.clear();

        assert!(sink.messages().is_empty());
    }

    #[test]
    fn test_forget_and_report_uncaught() {
        let (sink, handlers, runtime) = setup();
        let context = Context::full(&runtime).unwrap();

        context.with(|ctx| {
            let promise: Value = ctx.eval("Promise.reject(new Error('script failed'))").unwrap();
            drain(&ctx);
            assert_eq!(handlers.pending(), 1);

            handlers.forget(&ctx, &promise);
            assert_eq!(handlers.pending(), 0);

            let thrown: Value = ctx.eval("new Error('script failed')").unwrap();
            handlers.report_uncaught(&ctx, &thrown);
        });
        handlers.clear();

        assert_eq!(sink.types(), vec![MessageType::Exception]);
        let stack = sink.messages()[0].exception().unwrap().stack.unwrap();
        assert!(stack.starts_with("Uncaught Error: script failed"));
    }
}
