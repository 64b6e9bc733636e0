//! Timers and microtasks
//!
//! `setTimeout` and `setInterval` register callbacks on a [`TimerQueue`] that
//! the worker's event loop drives: it asks for the next deadline, sleeps until
//! then and fires whatever is due. Delays follow Node: anything below one
//! millisecond, `NaN` or above the 32-bit limit becomes one millisecond.

use rquickjs::function::{Opt, Rest};
use rquickjs::{Coerced, Ctx, Exception, Function, Persistent, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::failure::FailureHandlers;
use crate::capability::{Capability, CapabilityMetadata};
use crate::util;

/// Largest delay accepted before falling back to one millisecond
const TIMEOUT_MAX: f64 = 2_147_483_647.0;

const MICROTASK_SOURCE: &str = r#"
(function (report) {
  'use strict';
  return function queueMicrotask(callback) {
    if (typeof callback !== 'function') {
      throw new TypeError('The "callback" argument must be of type function');
    }
    Promise.resolve().then(() => callback()).catch(report);
  };
})
"#;

struct Timer {
    callback: Persistent<Function<'static>>,
    args: Vec<Persistent<Value<'static>>>,
    due: Instant,
    interval: Option<Duration>,
}

#[derive(Default)]
struct TimerState {
    next_id: u32,
    timers: BTreeMap<u32, Timer>,
}

/// A timer whose deadline has passed, ready to be called
pub struct DueTimer {
    pub id: u32,
    callback: Persistent<Function<'static>>,
    args: Vec<Persistent<Value<'static>>>,
}

impl DueTimer {
    /// Calls the callback
    ///
    /// A throwing callback leaves its exception pending on the context.
    pub fn call<'js>(self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let callback = self.callback.restore(ctx)?;
        let args = self
            .args
            .into_iter()
            .map(|arg| arg.restore(ctx))
            .collect::<rquickjs::Result<Vec<_>>>()?;
        callback.call::<_, Value>((Rest(args),))?;
        Ok(())
    }
}

/// Pending timers of one job
#[derive(Clone, Default)]
pub struct TimerQueue {
    state: Rc<RefCell<TimerState>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn schedule(&self, timer: Timer) -> u32 {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = state.next_id;
        state.timers.insert(id, timer);
        id
    }

    fn cancel(&self, id: u32) {
        self.state.borrow_mut().timers.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.state.borrow().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().timers.is_empty()
    }

    /// Earliest deadline among pending timers
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.borrow().timers.values().map(|t| t.due).min()
    }

    /// Takes the earliest timer due at `now`
    ///
    /// Ties go to the timer created first. Intervals are rescheduled from
    /// `now` before being returned, so a callback may clear its own interval.
    pub fn take_due(&self, now: Instant) -> Option<DueTimer> {
        let mut state = self.state.borrow_mut();
        let id = state
            .timers
            .iter()
            .filter(|(_, timer)| timer.due <= now)
            .min_by_key(|(id, timer)| (timer.due, **id))
            .map(|(id, _)| *id)?;

        let interval = state.timers.get(&id)?.interval;
        match interval {
            Some(interval) => {
                let timer = state.timers.get_mut(&id)?;
                timer.due = now + interval;
                Some(DueTimer {
                    id,
                    callback: timer.callback.clone(),
                    args: timer.args.clone(),
                })
            }
            None => state.timers.remove(&id).map(|timer| DueTimer {
                id,
                callback: timer.callback,
                args: timer.args,
            }),
        }
    }

    /// Abandons every pending timer
    ///
    /// Must run before the runtime is dropped.
    pub fn clear(&self) {
        self.state.borrow_mut().timers.clear();
    }
}

fn clamp_delay(delay: Option<f64>) -> Duration {
    match delay {
        Some(ms) if ms >= 1.0 && ms <= TIMEOUT_MAX => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(1),
    }
}

fn timer_id(value: Option<Coerced<f64>>) -> Option<u32> {
    value
        .map(|Coerced(id)| id)
        .filter(|id| id.is_finite() && *id >= 0.0 && id.fract() == 0.0 && *id <= u32::MAX as f64)
        .map(|id| id as u32)
}

pub struct TimerCapability {
    queue: TimerQueue,
    failures: FailureHandlers,
}

impl TimerCapability {
    pub fn new(queue: TimerQueue, failures: FailureHandlers) -> Self {
        Self { queue, failures }
    }

    fn scheduler<'js>(&self, ctx: &Ctx<'js>, name: &str, repeat: bool) -> rquickjs::Result<Function<'js>> {
        let queue = self.queue.clone();
        let function = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, callback: Value<'js>, delay: Opt<Coerced<f64>>, args: Rest<Value<'js>>| {
                let Some(callback) = callback.into_function() else {
                    return Err(Exception::throw_type(
                        &ctx,
                        "The \"callback\" argument must be of type function",
                    ));
                };
                let delay = clamp_delay(delay.0.map(|Coerced(ms)| ms));
                let timer = Timer {
                    callback: Persistent::save(&ctx, callback),
                    args: args.0.into_iter().map(|arg| Persistent::save(&ctx, arg)).collect(),
                    due: Instant::now() + delay,
                    interval: repeat.then_some(delay),
                };
                Ok(queue.schedule(timer))
            },
        )?;
        function.set_name(name)?;
        Ok(function)
    }

    fn canceller<'js>(&self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Function<'js>> {
        let queue = self.queue.clone();
        let function = Function::new(ctx.clone(), move |id: Opt<Coerced<f64>>| {
            if let Some(id) = timer_id(id.0) {
                queue.cancel(id);
            }
        })?;
        function.set_name(name)?;
        Ok(function)
    }
}

impl Capability for TimerCapability {
    fn id(&self) -> &'static str {
        "timers"
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let globals = ctx.globals();

        let functions = [
            ("setTimeout", self.scheduler(ctx, "setTimeout", false)?),
            ("setInterval", self.scheduler(ctx, "setInterval", true)?),
            ("clearTimeout", self.canceller(ctx, "clearTimeout")?),
            ("clearInterval", self.canceller(ctx, "clearInterval")?),
        ];

        let failures = self.failures.clone();
        let report = Function::new(ctx.clone(), move |ctx: Ctx<'js>, thrown: Value<'js>| {
            failures.report_uncaught(&ctx, &thrown);
        })?;
        let factory: Function = ctx.eval(MICROTASK_SOURCE)?;
        let queue_microtask: Function = factory.call((report,))?;

        for (name, function) in functions.into_iter().chain([("queueMicrotask", queue_microtask)]) {
            util::freeze(ctx, &function)?;
            util::define_locked(&globals, name, function)?;
        }
        Ok(())
    }

    fn declarations(&self) -> String {
        r#"declare function setTimeout(callback: (...args: any[]) => void, ms?: number, ...args: any[]): number;
declare function setInterval(callback: (...args: any[]) => void, ms?: number, ...args: any[]): number;
declare function clearTimeout(id?: number): void;
declare function clearInterval(id?: number): void;
declare function queueMicrotask(callback: () => void): void;
"#
        .to_string()
    }

    fn metadata(&self) -> CapabilityMetadata {
        CapabilityMetadata {
            id: self.id(),
            version: "1.0.0",
            description: "Timers driven by the worker event loop",
        }
    }
}
