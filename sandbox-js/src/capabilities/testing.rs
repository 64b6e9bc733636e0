//! Test harness
//!
//! Installed only for jobs submitted with `testing` set. Scripts register
//! tests with `test`, `test.only` and `test.skip` and assert with `expect`.
//! Nothing runs while the script body executes: the worker calls
//! [`TestHarness::start`] once the body has settled, and the registered tests
//! then run one after another, each posting `test` reports.

use rquickjs::function::Opt;
use rquickjs::{Ctx, Function, Object, Persistent, Promise, Value};
use sandbox_core::domain::message::MessageType;
use sandbox_core::domain::test::{TestReport, TestStatus};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::warn;

use super::failure::FailureHandlers;
use crate::capability::{Capability, CapabilityMetadata};
use crate::channel::Channel;
use crate::util;

const HARNESS_SOURCE: &str = include_str!("testing.js");

/// Handle to the installed harness
#[derive(Clone, Default)]
pub struct TestHarness {
    runner: Rc<RefCell<Option<Persistent<Function<'static>>>>>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_installed(&self) -> bool {
        self.runner.borrow().is_some()
    }

    /// Runs the registered tests
    ///
    /// Returns the promise that settles once every test has finished, or
    /// `None` if the harness is not installed. Can only be started once.
    pub fn start<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Option<Promise<'js>>> {
        let Some(runner) = self.runner.borrow_mut().take() else {
            return Ok(None);
        };
        let run = runner.restore(ctx)?;
        run.call::<_, Promise>(()).map(Some)
    }

    /// Must run before the runtime is dropped
    pub fn clear(&self) {
        self.runner.borrow_mut().take();
    }
}

fn parse_status(status: &str) -> Option<TestStatus> {
    match status {
        "running" => Some(TestStatus::Running),
        "passed" => Some(TestStatus::Passed),
        "failed" => Some(TestStatus::Failed),
        "skipped" => Some(TestStatus::Skipped),
        _ => None,
    }
}

pub struct TestingCapability {
    harness: TestHarness,
    channel: Channel,
    failures: FailureHandlers,
}

impl TestingCapability {
    pub fn new(harness: TestHarness, channel: Channel, failures: FailureHandlers) -> Self {
        Self {
            harness,
            channel,
            failures,
        }
    }
}

impl Capability for TestingCapability {
    fn id(&self) -> &'static str {
        "testing"
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let channel = self.channel.clone();
        let post = Function::new(
            ctx.clone(),
            move |status: String, name: String, message: String, duration: Opt<f64>| {
                let Some(status) = parse_status(&status) else {
                    warn!("test harness posted unknown status {}", status);
                    return;
                };
                let report = TestReport {
                    status,
                    name,
                    message,
                    event_timestamp: chrono::Utc::now().timestamp_millis(),
                    duration_ms: duration.0.filter(|d| d.is_finite() && *d >= 0.0).map(|d| d as u64),
                };
                match serde_json::to_value(&report) {
                    Ok(payload) => {
                        channel.post(MessageType::Test, payload);
                    }
                    Err(err) => warn!("failed to encode test report: {}", err),
                }
            },
        )?;

        let failures = self.failures.clone();
        let report_uncaught = Function::new(ctx.clone(), move |ctx: Ctx<'js>, thrown: Value<'js>| {
            failures.report_uncaught(&ctx, &thrown);
        })?;

        let factory: Function = ctx.eval(HARNESS_SOURCE)?;
        let harness: Object = factory.call((post, report_uncaught))?;

        let globals = ctx.globals();
        let test: Function = harness.get("test")?;
        let expect: Function = harness.get("expect")?;
        util::define_locked(&globals, "test", test)?;
        util::define_locked(&globals, "expect", expect)?;

        let run: Function = harness.get("run")?;
        *self.harness.runner.borrow_mut() = Some(Persistent::save(ctx, run));
        Ok(())
    }

    fn declarations(&self) -> String {
        r#"interface Matchers {
  toBe(expected: unknown): void;
  toEqual(expected: unknown): void;
  toBeTruthy(): void;
  toBeFalsy(): void;
  toBeNull(): void;
  toBeUndefined(): void;
  toBeDefined(): void;
  toContain(item: unknown): void;
  toHaveLength(length: number): void;
  toBeGreaterThan(bound: number): void;
  toBeLessThan(bound: number): void;
  toMatch(pattern: string | RegExp): void;
  toThrow(expected?: string | RegExp | Function): void;
}
/** Registers a test. Tests run after the script body, in order. */
declare const test: {
  (name: string, fn: () => unknown | Promise<unknown>): void;
  /** When any test uses `only`, every other test is skipped */
  only(name: string, fn: () => unknown | Promise<unknown>): void;
  skip(name: string, fn?: () => unknown | Promise<unknown>): void;
};
declare function expect(actual: unknown): Matchers & { not: Matchers };
"#
        .to_string()
    }

    fn metadata(&self) -> CapabilityMetadata {
        CapabilityMetadata {
            id: self.id(),
            version: "1.0.0",
            description: "test/expect harness for testing jobs",
        }
    }
}
