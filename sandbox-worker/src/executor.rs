//! Script executor
//!
//! Runs one job from bootstrap to terminal status:
//! - Builds the sandbox and installs the capabilities in their fixed order
//! - Rewrites static imports, then compiles the script as the body of an
//!   async function taking `input`
//! - Drives the event loop (jobs, timers and fetches) until the script and
//!   its tests settle, the script closes itself, nothing is left to run, or
//!   the deadline passes
//! - Flushes unhandled rejections, posts `complete` and the terminal status

use rquickjs::promise::PromiseState;
use rquickjs::{Ctx, Function, Promise, Value};
use sandbox_core::domain::error::SerializedError;
use sandbox_core::domain::job::JobStatus;
use sandbox_core::domain::message::{MessageType, StatusReport};
use sandbox_core::protocol::WorkerRequest;
use sandbox_js::errors::{ErrorOrigin, take_exception};
use sandbox_js::{
    CapabilityRegistry, Channel, ConsoleCapability, EnvCapability, FailureCapability,
    FailureHandlers, FetchCapability, FetchQueue, FsCapability, MessageSink, ModuleCapability,
    ProcessCapability, Sandbox, TerminationCapability, TerminationGuard, TestHarness,
    TestingCapability, TimerCapability, TimerQueue, util,
};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::imports;

/// Compiles the script into an entry point taking `input`
///
/// A script that returns a function is in function mode: the function is
/// called with `input` and its result becomes the script's result.
const COMPILE_SOURCE: &str = r#"
(function (source) {
  const AsyncFunction = (async function () {}).constructor;
  const body = new AsyncFunction('input', source);
  return async function (input) {
    const value = await body(input);
    return typeof value === 'function' ? value(input) : value;
  };
})
"#;

/// Longest single sleep of the event loop
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(50);

/// Shared state of one job's capabilities
struct Job {
    channel: Channel,
    guard: TerminationGuard,
    failures: FailureHandlers,
    timers: TimerQueue,
    fetches: FetchQueue,
    harness: TestHarness,
}

impl Job {
    fn new<S: MessageSink + 'static>(job_id: &str, sink: S) -> Self {
        let channel = Channel::new(job_id, sink);
        Self {
            guard: TerminationGuard::new(channel.clone()),
            failures: FailureHandlers::new(channel.clone()),
            timers: TimerQueue::new(),
            fetches: FetchQueue::new(),
            harness: TestHarness::new(),
            channel,
        }
    }

    /// Releases every engine value held outside the context
    fn release(&self) {
        self.failures.clear();
        self.timers.clear();
        self.fetches.clear();
        self.harness.clear();
    }
}

/// What the event loop is waiting for
enum Waiting<'js> {
    Script(Promise<'js>),
    Tests(Promise<'js>),
}

enum Settle<'js> {
    Pending(Waiting<'js>),
    /// Settled, and something new started
    Next(Waiting<'js>),
    Done,
}

pub struct ScriptExecutor {
    config: Config,
}

impl ScriptExecutor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Runs a job, posting every message to `sink`
    ///
    /// Returns the terminal status that was posted.
    pub fn execute<S: MessageSink + 'static>(&self, request: WorkerRequest, sink: S) -> JobStatus {
        let job = Job::new(&request.job_id, sink);

        let status = match Sandbox::new(&request.limits) {
            Ok(sandbox) => {
                let status = self.run(&request, &job, &sandbox);
                job.release();
                status
            }
            Err(e) => {
                warn!("Failed to create sandbox: {}", e);
                job.channel
                    .post_exception(&SerializedError::new("Error", e.to_string()));
                job.guard.close();
                job.channel.finish(StatusReport::failed(e.to_string()));
                JobStatus::Failed
            }
        };

        info!("Job {} finished with status {}", request.job_id, status);
        status
    }

    fn registry(&self, request: &WorkerRequest, job: &Job) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register(EnvCapability::new(request.env.clone()));
        registry.register(ConsoleCapability::new(job.channel.clone()));
        registry.register(ProcessCapability::new(
            request.env.clone(),
            self.config.work_dir.to_string_lossy(),
            job.channel.clone(),
            job.guard.clone(),
        ));
        registry.register(TerminationCapability::new(job.guard.clone()));
        registry.register(FailureCapability::new(job.failures.clone()));
        registry.register(FsCapability::new(self.config.work_dir.clone()));
        registry.register(ModuleCapability);
        registry.register(TimerCapability::new(job.timers.clone(), job.failures.clone()));
        registry.register(FetchCapability::new(job.fetches.clone(), request.allow_network));
        if request.testing {
            registry.register(TestingCapability::new(
                job.harness.clone(),
                job.channel.clone(),
                job.failures.clone(),
            ));
        }
        registry
    }

    fn run(&self, request: &WorkerRequest, job: &Job, sandbox: &Sandbox) -> JobStatus {
        let report = sandbox.install(&self.registry(request, job));
        debug!("Installed capabilities: {:?}", report.installed);
        if !report.is_complete() {
            warn!("{} capabilities failed to install", report.failed.len());
        }

        let budget = self.config.timeout_for(request.timeout_ms) + self.config.deadline_grace;
        let deadline = Instant::now() + budget;
        let timed_out = Rc::new(Cell::new(false));
        {
            let closed = job.guard.flag();
            let timed_out = timed_out.clone();
            sandbox.runtime().set_interrupt_handler(Some(Box::new(move || {
                if closed.get() {
                    return true;
                }
                if Instant::now() >= deadline {
                    timed_out.set(true);
                    return true;
                }
                false
            })));
        }

        let event_loop = EventLoop {
            job,
            deadline,
            timed_out: timed_out.clone(),
        };
        sandbox.context().with(|ctx| event_loop.run(&ctx, request));

        if timed_out.get() {
            info!("Job {} reached its deadline", request.job_id);
            job.channel.finish(StatusReport::timeout());
            return JobStatus::Timeout;
        }

        sandbox.context().with(|ctx| {
            job.failures.flush(&ctx);
        });
        job.guard.close();

        match job.channel.first_exception() {
            Some(error) => {
                job.channel.finish(StatusReport::failed(error));
                JobStatus::Failed
            }
            None => {
                job.channel.finish(StatusReport::completed());
                JobStatus::Completed
            }
        }
    }
}

struct EventLoop<'a> {
    job: &'a Job,
    deadline: Instant,
    timed_out: Rc<Cell<bool>>,
}

impl EventLoop<'_> {
    fn stopped(&self) -> bool {
        if self.job.guard.is_closed() || self.timed_out.get() {
            return true;
        }
        if Instant::now() >= self.deadline {
            self.timed_out.set(true);
            return true;
        }
        false
    }

    /// Reports the pending exception, unless the interrupt handler raised it
    fn report_pending<'js>(&self, ctx: &Ctx<'js>) {
        let thrown = ctx.catch();
        if self.stopped() {
            return;
        }
        self.job.failures.report_uncaught(ctx, &thrown);
    }

    /// Runs queued jobs until none are left
    ///
    /// Returns false if the loop should stop.
    fn drain<'js>(&self, ctx: &Ctx<'js>) -> bool {
        while ctx.execute_pending_job() {
            if self.stopped() {
                return false;
            }
        }
        !self.stopped()
    }

    fn start<'js>(&self, ctx: &Ctx<'js>, request: &WorkerRequest) -> Option<Promise<'js>> {
        let compile: Function = match ctx.eval(COMPILE_SOURCE) {
            Ok(compile) => compile,
            Err(e) => {
                warn!("Failed to prepare compiler: {}", e);
                self.report_pending(ctx);
                return None;
            }
        };
        let source = imports::rewrite(&request.script);
        let entry: Function = match compile.call((source.as_str(),)) {
            Ok(entry) => entry,
            Err(_) => {
                self.report_pending(ctx);
                return None;
            }
        };

        let input = match &request.input {
            Some(input) => match util::from_json(ctx, input) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Failed to convert input: {}", e);
                    self.report_pending(ctx);
                    return None;
                }
            },
            None => Value::new_undefined(ctx.clone()),
        };

        match entry.call::<_, Promise>((input,)) {
            Ok(promise) => Some(promise),
            Err(_) => {
                self.report_pending(ctx);
                None
            }
        }
    }

    /// Posts the script's value as a `result` message
    fn post_result<'js>(&self, ctx: &Ctx<'js>, value: &Value<'js>) {
        if value.is_undefined() {
            return;
        }
        match util::to_json(ctx, value) {
            Ok(Some(json)) => {
                self.job.channel.post(MessageType::Result, json);
            }
            Ok(None) => debug!("Result of type {} has no JSON form", value.type_name()),
            Err(_) => {
                let error = take_exception(ctx, ErrorOrigin::Uncaught);
                self.job.channel.post_exception(&error);
            }
        }
    }

    /// Reports a rejected promise the loop was waiting on
    fn rejected<'js>(&self, ctx: &Ctx<'js>, promise: &Promise<'js>) {
        self.job.failures.forget(ctx, promise.as_value());
        if let Some(Err(_)) = promise.result::<Value>() {
            self.report_pending(ctx);
        }
    }

    fn settle<'js>(&self, ctx: &Ctx<'js>, waiting: Waiting<'js>) -> Settle<'js> {
        match waiting {
            Waiting::Script(promise) => match promise.state() {
                PromiseState::Pending => Settle::Pending(Waiting::Script(promise)),
                PromiseState::Resolved => {
                    if let Some(Ok(value)) = promise.result::<Value>() {
                        self.post_result(ctx, &value);
                    }
                    match self.job.harness.start(ctx) {
                        Ok(Some(tests)) => Settle::Next(Waiting::Tests(tests)),
                        Ok(None) => Settle::Done,
                        Err(_) => {
                            self.report_pending(ctx);
                            Settle::Done
                        }
                    }
                }
                PromiseState::Rejected => {
                    self.rejected(ctx, &promise);
                    Settle::Done
                }
            },
            Waiting::Tests(promise) => match promise.state() {
                PromiseState::Pending => Settle::Pending(Waiting::Tests(promise)),
                PromiseState::Resolved => Settle::Done,
                PromiseState::Rejected => {
                    self.rejected(ctx, &promise);
                    Settle::Done
                }
            },
        }
    }

    /// Fires every timer due now, draining jobs after each one
    ///
    /// Returns false if the loop should stop.
    fn fire_timers<'js>(&self, ctx: &Ctx<'js>) -> bool {
        let now = Instant::now();
        while let Some(timer) = self.job.timers.take_due(now) {
            let id = timer.id;
            if timer.call(ctx).is_err() {
                debug!("Timer {} threw", id);
                self.report_pending(ctx);
            }
            if !self.drain(ctx) {
                return false;
            }
        }
        true
    }

    /// Settles every fetch whose answer has arrived
    ///
    /// Returns false if the loop should stop.
    fn settle_fetches<'js>(&self, ctx: &Ctx<'js>) -> bool {
        while let Some(done) = self.job.fetches.take_completed() {
            let id = done.id;
            if done.settle(ctx).is_err() {
                debug!("Settling fetch {} threw", id);
                self.report_pending(ctx);
            }
            if !self.drain(ctx) {
                return false;
            }
        }
        true
    }

    fn run<'js>(&self, ctx: &Ctx<'js>, request: &WorkerRequest) {
        let Some(promise) = self.start(ctx, request) else {
            return;
        };
        let mut waiting = Waiting::Script(promise);

        loop {
            if !self.drain(ctx) {
                return;
            }

            waiting = match self.settle(ctx, waiting) {
                Settle::Pending(waiting) => waiting,
                Settle::Next(next) => {
                    waiting = next;
                    continue;
                }
                Settle::Done => return,
            };

            self.job.failures.flush(ctx);

            if !self.fire_timers(ctx) || !self.settle_fetches(ctx) {
                return;
            }

            let next_timer = self.job.timers.next_deadline();
            if next_timer.is_none() && self.job.fetches.is_idle() {
                debug!("Event loop is idle with nothing left to run");
                return;
            }

            let now = Instant::now();
            let wake = next_timer.map_or(self.deadline, |next| next.min(self.deadline));
            if wake > now {
                self.job.fetches.wait((wake - now).min(MAX_IDLE_SLEEP));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_core::domain::env::EnvSnapshot;
    use sandbox_core::domain::message::{CLOSING_NOTICE, Message, TIMEOUT_ERROR};
    use sandbox_core::domain::test::TestStatus;
    use sandbox_js::MemorySink;
    use serde_json::json;
    use std::path::PathBuf;

    fn request(script: &str) -> WorkerRequest {
        WorkerRequest {
            job_id: "job-1".to_string(),
            script: script.to_string(),
            env: EnvSnapshot::default().with_var("NODE_ENV", "testing"),
            timeout_ms: 2_000,
            input: None,
            testing: false,
            allow_network: false,
            limits: Default::default(),
        }
    }

    fn execute(request: WorkerRequest) -> (JobStatus, Vec<Message>) {
        execute_in(request, Config::default().work_dir)
    }

    fn execute_in(request: WorkerRequest, work_dir: PathBuf) -> (JobStatus, Vec<Message>) {
        let mut config = Config::new(work_dir);
        config.deadline_grace = Duration::from_millis(100);
        let sink = MemorySink::new();
        let status = ScriptExecutor::new(config).execute(request, sink.clone());
        (status, sink.messages())
    }

    fn logs(messages: &[Message]) -> Vec<&str> {
        messages
            .iter()
            .filter(|m| m.message_type == MessageType::Log)
            .filter_map(|m| m.text())
            .collect()
    }

    fn types(messages: &[Message]) -> Vec<MessageType> {
        messages.iter().map(|m| m.message_type).collect()
    }

    fn assert_single_terminal_status(messages: &[Message]) {
        let statuses = messages.iter().filter(|m| m.is_terminal()).count();
        assert_eq!(statuses, 1);
        assert!(messages.last().unwrap().is_terminal());
        let ids: Vec<u64> = messages.iter().map(|m| m.message_id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_log_then_exit() {
        let (status, messages) = execute(request("console.log('hello'); exit(); console.log('never')"));

        assert_eq!(status, JobStatus::Completed);
        assert_eq!(
            types(&messages),
            vec![MessageType::Log, MessageType::Complete, MessageType::Status]
        );
        assert_eq!(messages[0].text(), Some("hello"));
        assert_eq!(messages[1].text(), Some(CLOSING_NOTICE));
        assert_single_terminal_status(&messages);
    }

    #[test]
    fn test_thrown_error_fails_the_job() {
        let (status, messages) = execute(request("throw new Error('boom')"));

        assert_eq!(status, JobStatus::Failed);
        let error = messages[0].exception().unwrap();
        assert_eq!(error.name.as_deref(), Some("Error"));
        assert_eq!(error.message, "boom");
        assert!(error.stack.unwrap().starts_with("Uncaught Error: boom"));

        let report = messages.last().unwrap().status_report().unwrap();
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("Error: boom"));
        assert_single_terminal_status(&messages);
    }

    #[test]
    fn test_syntax_error() {
        let (status, messages) = execute(request("let = ;"));

        assert_eq!(status, JobStatus::Failed);
        assert_eq!(messages[0].exception().unwrap().name.as_deref(), Some("SyntaxError"));
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let mut request = request("while (true) {}");
        request.timeout_ms = 200;
        let (status, messages) = execute(request);

        assert_eq!(status, JobStatus::Timeout);
        assert_eq!(types(&messages), vec![MessageType::Status]);
        let report = messages[0].status_report().unwrap();
        assert_eq!(report.error.as_deref(), Some(TIMEOUT_ERROR));
    }

    #[test]
    fn test_top_level_await_and_result() {
        let (status, messages) = execute(request(
            "const value = await new Promise((resolve) => setTimeout(() => resolve(21), 10)); return { doubled: value * 2 };",
        ));

        assert_eq!(status, JobStatus::Completed);
        let result = messages.iter().find(|m| m.message_type == MessageType::Result).unwrap();
        assert_eq!(result.payload, json!({ "doubled": 42 }));
    }

    #[test]
    fn test_function_mode() {
        let mut request = request("return async (input) => input.items.map((n) => n + 1)");
        request.input = Some(json!({ "items": [1, 2, 3] }));
        let (status, messages) = execute(request);

        assert_eq!(status, JobStatus::Completed);
        let result = messages.iter().find(|m| m.message_type == MessageType::Result).unwrap();
        assert_eq!(result.payload, json!([2, 3, 4]));
    }

    #[test]
    fn test_unserializable_results() {
        for script in ["return 10n", "const a = {}; a.self = a; return a"] {
            let (status, messages) = execute(request(script));
            assert_eq!(status, JobStatus::Failed, "{}", script);
            assert!(messages.iter().all(|m| m.message_type != MessageType::Result));
            assert_eq!(messages[0].message_type, MessageType::Exception);
        }
    }

    #[test]
    fn test_unhandled_rejection() {
        let (status, messages) = execute(request("Promise.reject(new TypeError('lost'));"));

        assert_eq!(status, JobStatus::Failed);
        let error = messages[0].exception().unwrap();
        assert!(error.stack.unwrap().starts_with("Unhandled rejection TypeError: lost"));
    }

    #[test]
    fn test_timers_after_settle_are_abandoned() {
        let (status, messages) = execute(request(
            "setTimeout(() => console.log('late'), 5_000); console.log('done');",
        ));

        assert_eq!(status, JobStatus::Completed);
        let logs: Vec<_> = messages.iter().filter_map(|m| m.text()).collect();
        assert_eq!(logs, vec!["done", CLOSING_NOTICE]);
    }

    #[test]
    fn test_denied_modules() {
        let (status, messages) = execute(request(
            r#"
            try { require('node:fs').readFileSync('/etc/passwd') } catch (err) { console.log(err.name) }
            try { await import('node:child_process') } catch (err) { console.log(err.name) }
            try { await import('npm:left-pad') } catch (err) { console.log(err.name) }
            try { fs.readFileSync('/etc/passwd') } catch (err) { console.log(err.name) }
            try { await fetch('http://127.0.0.1:9/') } catch (err) { console.log(err.name) }
            "#,
        ));

        assert_eq!(status, JobStatus::Completed);
        assert_eq!(logs(&messages), vec!["PermissionDenied"; 5]);
    }

    #[test]
    fn test_static_imports_and_job_files() {
        let dir = tempfile::tempdir().unwrap();
        let (status, messages) = execute_in(
            request(
                r#"
                import { writeFile, readdir } from 'node:fs/promises'
                import path from 'path'
                import fs from 'fs'

                await writeFile(path.join('out', '..', 'page.html'), '<h1>Title</h1>');
                fs.mkdirSync('out');
                console.log((await readdir('.')).join(','));
                return fs.readFileSync(path.resolve('page.html'));
                "#,
            ),
            dir.path().to_path_buf(),
        );

        assert_eq!(status, JobStatus::Completed);
        assert_eq!(logs(&messages), vec!["out,page.html"]);
        let result = messages.iter().find(|m| m.message_type == MessageType::Result).unwrap();
        assert_eq!(result.payload, json!("<h1>Title</h1>"));
        assert!(dir.path().join("page.html").is_file());
    }

    #[test]
    fn test_denied_static_import() {
        let (status, messages) = execute(request(
            "import {\n  join,\n} from 'path'\nimport os from 'os'\n",
        ));

        assert_eq!(status, JobStatus::Failed);
        let error = messages[0].exception().unwrap();
        assert_eq!(error.name.as_deref(), Some("PermissionDenied"));
        assert_eq!(error.message, "import of \"os\" is not allowed in the sandbox");
    }

    #[test]
    fn test_process_env_matches_snapshot() {
        let (_, messages) = execute(request(
            "process.env.NODE_ENV = 'production'; console.log(JSON.stringify(process.env)); process.exit(0)",
        ));

        assert_eq!(messages[0].text(), Some(r#"{"NODE_ENV":"testing"}"#));
        assert_eq!(messages[1].message_type, MessageType::Complete);
    }

    #[test]
    fn test_harness_runs_after_body() {
        let mut request = request(
            r#"
            console.log('body');
            test('passes', async () => { await null; expect([1, 2]).toContain(2) });
            test('fails', () => expect(1).toBe(2));
            "#,
        );
        request.testing = true;
        let (status, messages) = execute(request);

        assert_eq!(status, JobStatus::Completed);
        assert_eq!(messages[0].text(), Some("body"));
        let reports: Vec<_> = messages.iter().filter_map(|m| m.test_report()).collect();
        let statuses: Vec<_> = reports.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                TestStatus::Running,
                TestStatus::Passed,
                TestStatus::Running,
                TestStatus::Failed,
            ]
        );
    }

    #[test]
    fn test_harness_absent_without_testing() {
        let (status, messages) = execute(request("console.log(typeof test, typeof expect)"));

        assert_eq!(status, JobStatus::Completed);
        assert_eq!(messages[0].text(), Some("undefined undefined"));
    }
}
