//! Minimal `process` shim
//!
//! Scripts written for Node expect a `process` global. This one exposes a
//! frozen copy of the environment snapshot, a fixed working directory, a
//! millisecond-granularity `hrtime`, a small event registry and exits that
//! route through the termination guard. Nothing else.

use rquickjs::function::{Opt, Rest};
use rquickjs::{Array, BigInt, Coerced, Ctx, Function, Object, Value};
use sandbox_core::domain::env::EnvSnapshot;
use sandbox_core::domain::message::MessageType;
use serde_json::Value as JsonValue;
use std::time::Instant;

use super::env::snapshot_object;
use super::termination::TerminationGuard;
use crate::capability::{Capability, CapabilityMetadata};
use crate::channel::Channel;
use crate::util;

/// Reported as `process.versions.node` for scripts that sniff the runtime
const NODE_COMPAT_VERSION: &str = "20.0.0-sandbox";

const EVENTS_SOURCE: &str = r#"
(function (report) {
  'use strict';
  const registry = new Map();
  return {
    on(event, listener) {
      if (typeof listener !== 'function') {
        throw new TypeError('The "listener" argument must be a function');
      }
      const listeners = registry.get(event) || [];
      listeners.push(listener);
      registry.set(event, listeners);
    },
    off(event, listener) {
      const listeners = registry.get(event);
      if (!listeners) return;
      const index = listeners.indexOf(listener);
      if (index !== -1) listeners.splice(index, 1);
    },
    emit(event, ...args) {
      const listeners = registry.get(event);
      if (!listeners || listeners.length === 0) return false;
      for (const listener of [...listeners]) {
        try {
          listener(...args);
        } catch (err) {
          report(String(event), err);
        }
      }
      return true;
    },
  };
})
"#;

pub struct ProcessCapability {
    snapshot: EnvSnapshot,
    cwd: String,
    started: Instant,
    channel: Channel,
    guard: TerminationGuard,
}

impl ProcessCapability {
    /// `cwd` is fixed at bootstrap and never derived from the script
    pub fn new(snapshot: EnvSnapshot, cwd: impl Into<String>, channel: Channel, guard: TerminationGuard) -> Self {
        Self {
            snapshot,
            cwd: cwd.into(),
            started: Instant::now(),
            channel,
            guard,
        }
    }

    fn hrtime<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Function<'js>> {
        let started = self.started;
        let hrtime = Function::new(ctx.clone(), move |ctx: Ctx<'js>, previous: Opt<Value<'js>>| {
            let (sec, nsec) = split_millis(started.elapsed().as_millis() as u64);
            let (sec, nsec) = match previous.0.and_then(|p| read_pair(&ctx, &p)) {
                Some((prev_sec, prev_nsec)) => diff((sec, nsec), (prev_sec, prev_nsec)),
                None => (sec, nsec),
            };
            let pair = Array::new(ctx.clone())?;
            pair.set(0, sec)?;
            pair.set(1, nsec)?;
            Ok::<_, rquickjs::Error>(pair)
        })?;
        hrtime.set_name("hrtime")?;

        let bigint = Function::new(ctx.clone(), move |ctx: Ctx<'js>| {
            let nanos = started.elapsed().as_millis() as i64 * 1_000_000;
            BigInt::from_i64(ctx, nanos)
        })?;
        util::freeze(ctx, &bigint)?;
        hrtime.set("bigint", bigint)?;
        util::freeze(ctx, &hrtime)?;
        Ok(hrtime)
    }
}

fn split_millis(millis: u64) -> (i64, i64) {
    ((millis / 1000) as i64, ((millis % 1000) * 1_000_000) as i64)
}

fn diff(current: (i64, i64), previous: (i64, i64)) -> (i64, i64) {
    let mut sec = current.0 - previous.0;
    let mut nsec = current.1 - previous.1;
    if nsec < 0 {
        sec -= 1;
        nsec += 1_000_000_000;
    }
    (sec, nsec)
}

fn read_pair<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Option<(i64, i64)> {
    let array = value.as_array()?;
    let sec = array.get::<Coerced<f64>>(0);
    let nsec = array.get::<Coerced<f64>>(1);
    match (sec, nsec) {
        (Ok(Coerced(sec)), Ok(Coerced(nsec))) => Some((sec as i64, nsec as i64)),
        _ => {
            ctx.catch();
            None
        }
    }
}

impl Capability for ProcessCapability {
    fn id(&self) -> &'static str {
        "process"
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let process = Object::new(ctx.clone())?;

        let env = snapshot_object(ctx, &self.snapshot)?;
        util::freeze(ctx, &env)?;
        process.set("env", env)?;

        let cwd = self.cwd.clone();
        process.set("cwd", Function::new(ctx.clone(), move || cwd.clone())?)?;
        process.set("hrtime", self.hrtime(ctx)?)?;

        for name in ["exit", "abort", "kill"] {
            process.set(name, self.guard.close_function(ctx, name)?)?;
        }

        let versions = Object::new(ctx.clone())?;
        versions.set("node", NODE_COMPAT_VERSION)?;
        versions.set("sandbox", env!("CARGO_PKG_VERSION"))?;
        util::freeze(ctx, &versions)?;
        process.set("versions", versions)?;
        process.set("platform", "sandbox")?;

        let argv = Array::new(ctx.clone())?;
        util::freeze(ctx, &argv)?;
        process.set("argv", argv)?;

        let channel = self.channel.clone();
        let report = Function::new(ctx.clone(), move |ctx: Ctx<'js>, event: String, error: Rest<Value<'js>>| {
            let detail = util::format_args(&ctx, &error.0);
            let line = format!("Error in process event listener for {} {}", event, detail);
            channel.post(MessageType::Error, JsonValue::String(line));
        })?;
        let factory: Function = ctx.eval(EVENTS_SOURCE)?;
        let events: Object = factory.call((report,))?;
        for name in ["on", "off", "emit"] {
            let method: Function = events.get(name)?;
            process.set(name, method)?;
        }

        util::freeze(ctx, &process)?;
        util::define_locked(&ctx.globals(), self.id(), process)
    }

    fn declarations(&self) -> String {
        r#"/** Minimal Node-style process object */
declare const process: {
  /** Frozen copy of the job's environment */
  readonly env: Readonly<Record<string, string>>;
  /** Working directory of the worker */
  cwd(): string;
  /** Monotonic time as [seconds, nanoseconds], millisecond granularity */
  hrtime: {
    (previous?: [number, number]): [number, number];
    bigint(): bigint;
  };
  on(event: string, listener: (...args: unknown[]) => void): void;
  off(event: string, listener: (...args: unknown[]) => void): void;
  emit(event: string, ...args: unknown[]): boolean;
  /** Ends the job */
  exit(code?: number): void;
  /** Ends the job */
  abort(): void;
  /** Ends the job */
  kill(pid?: number, signal?: string): void;
  readonly versions: Readonly<Record<string, string>>;
  readonly platform: "sandbox";
  readonly argv: readonly string[];
};
"#
        .to_string()
    }

    fn metadata(&self) -> CapabilityMetadata {
        CapabilityMetadata {
            id: self.id(),
            version: "1.0.0",
            description: "Minimal process shim",
        }
    }
}
