//! The real worker binary, supervised by the orchestrator

use futures::StreamExt;
use sandbox_core::domain::job::JobStatus;
use sandbox_core::domain::message::{CLOSING_NOTICE, Message, MessageType, TIMEOUT_ERROR};
use sandbox_core::domain::test::TestStatus;
use sandbox_core::dto::job::{ExecutionReport, SubmitJob};
use sandbox_orchestrator::{Config, JobOrchestrator};
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Engine {
    orchestrator: JobOrchestrator,
    _dir: TempDir,
}

impl Engine {
    fn new() -> Self {
        Self::configured(|_| {})
    }

    fn with_env_allow(env_allow: Vec<String>) -> Self {
        Self::configured(|config| config.env_allow = env_allow)
    }

    fn configured(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(PathBuf::from(env!("CARGO_BIN_EXE_sandbox-worker")));
        config.work_dir = dir.path().to_path_buf();
        adjust(&mut config);
        Self {
            orchestrator: JobOrchestrator::new(config),
            _dir: dir,
        }
    }

    async fn run(&self, req: SubmitJob) -> ExecutionReport {
        let report = self.orchestrator.run_buffered(req).await.unwrap();
        assert_eq!(report.messages.iter().filter(|m| m.is_terminal()).count(), 1);
        assert!(report.messages.last().unwrap().is_terminal());
        report
    }

    async fn script(&self, script: &str) -> ExecutionReport {
        self.run(SubmitJob::new(script)).await
    }
}

fn types(messages: &[Message]) -> Vec<MessageType> {
    messages.iter().map(|m| m.message_type).collect()
}

#[tokio::test]
async fn test_log_then_exit() {
    let report = Engine::new().script("console.log('hello'); exit()").await;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(
        types(&report.messages),
        vec![MessageType::Log, MessageType::Complete, MessageType::Status]
    );
    assert_eq!(report.messages[0].text(), Some("hello"));
    assert_eq!(report.messages[1].text(), Some(CLOSING_NOTICE));
    let ids: Vec<u64> = report.messages.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_every_exit_path_completes() {
    let engine = Engine::new();
    for script in ["exit()", "terminate()", "process.exit(0)", "close()", "console.log(1)"] {
        let report = engine.script(script).await;
        assert_eq!(report.status, JobStatus::Completed, "{}", script);
        let complete = report
            .messages
            .iter()
            .position(|m| m.message_type == MessageType::Complete);
        assert_eq!(complete, Some(report.messages.len() - 2), "{}", script);
    }
}

#[tokio::test]
async fn test_thrown_error() {
    let report = Engine::new().script("throw new Error('boom')").await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.error.as_deref(), Some("Error: boom"));
    let error = report.messages[0].exception().unwrap();
    assert_eq!(error.name.as_deref(), Some("Error"));
    assert_eq!(error.message, "boom");
    assert!(error.stack.is_some());
}

#[tokio::test]
async fn test_host_access_is_denied() {
    let report = Engine::new()
        .script(
            r#"
            try { require('fs').readFileSync('/etc/passwd') } catch (err) { console.log(err.name) }
            try { require('child_process').spawn('ls') } catch (err) { console.log(err.name) }
            try { await import('os') } catch (err) { console.log(err.name) }
            try { fs.readFileSync('/etc/passwd') } catch (err) { console.log(err.name) }
            try { await fetch('http://127.0.0.1:9/') } catch (err) { console.log(err.name) }
            console.log(typeof std, typeof os)
            "#,
        )
        .await;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(
        report.lines(MessageType::Log),
        vec![
            "PermissionDenied",
            "PermissionDenied",
            "PermissionDenied",
            "PermissionDenied",
            "PermissionDenied",
            "undefined undefined"
        ]
    );
}

#[tokio::test]
async fn test_files_stay_in_the_job_directory() {
    let engine = Engine::new();
    let report = engine
        .script(
            r#"
            import { writeFile, readFile, readdir } from 'node:fs/promises'
            import path from 'node:path'

            await writeFile('scraped.json', JSON.stringify({ title: 'Hello' }));
            const entries = await readdir(process.cwd());
            const data = JSON.parse(await readFile(path.join(process.cwd(), 'scraped.json')));
            try { await readFile('../../etc/passwd') } catch (err) { console.log(err.name) }
            return { entries, title: data.title };
            "#,
        )
        .await;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.lines(MessageType::Log), vec!["PermissionDenied"]);
    assert_eq!(
        report.result,
        Some(json!({ "entries": ["scraped.json"], "title": "Hello" }))
    );

    // The job directory is removed right after the terminal status
    let deadline = Instant::now() + Duration::from_secs(2);
    while std::fs::read_dir(engine._dir.path()).unwrap().next().is_some() {
        assert!(Instant::now() < deadline, "job directory was left behind");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_fetch_with_network_allowed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/items", listener.local_addr().unwrap());
    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
            line.clear();
        }
        let body = r#"["a","b"]"#;
        write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
        .unwrap();
    });

    let engine = Engine::configured(|config| config.allow_network = true);
    let report = engine
        .script(&format!(
            "const response = await fetch('{}'); return {{ status: response.status, items: await response.json() }}",
            url
        ))
        .await;
    server.join().unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.result, Some(json!({ "status": 200, "items": ["a", "b"] })));
}

#[tokio::test]
async fn test_large_result_arrives_whole() {
    let report = Engine::new()
        .script("return { page: 'x'.repeat(4 * 1024 * 1024), done: true }")
        .await;

    assert_eq!(report.status, JobStatus::Completed);
    let result = report.result.unwrap();
    assert_eq!(result["page"].as_str().map(str::len), Some(4 * 1024 * 1024));
    assert_eq!(result["done"], json!(true));
}

#[tokio::test]
async fn test_process_env_is_the_snapshot() {
    let engine = Engine::with_env_allow(vec!["PATH".to_string(), "SANDBOX_E2E_UNSET".to_string()]);
    let report = engine
        .script(
            r#"
            try { process.env.NODE_ENV = 'production' } catch (_) {}
            try { delete process.env.PATH } catch (_) {}
            console.log(JSON.stringify(process.env))
            "#,
        )
        .await;

    let expected = json!({
        "NODE_ENV": "development",
        "PATH": std::env::var("PATH").unwrap(),
    });
    let logged: serde_json::Value =
        serde_json::from_str(report.lines(MessageType::Log)[0]).unwrap();
    assert_eq!(logged, expected);
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let started = Instant::now();
    let report = Engine::new()
        .run(SubmitJob {
            timeout_ms: Some(2_000),
            ..SubmitJob::new("while (true) {}")
        })
        .await;

    assert_eq!(report.status, JobStatus::Timeout);
    assert_eq!(report.error.as_deref(), Some(TIMEOUT_ERROR));
    assert_eq!(types(&report.messages), vec![MessageType::Status]);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_function_mode() {
    let report = Engine::new()
        .run(SubmitJob {
            input: Some(json!({ "n": 21 })),
            ..SubmitJob::new("return (input) => ({ answer: input.n * 2 })")
        })
        .await;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.result, Some(json!({ "answer": 42 })));
}

#[tokio::test]
async fn test_unserializable_result() {
    let report = Engine::new().script("return 10n").await;

    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.result.is_none());
    assert_eq!(report.messages[0].message_type, MessageType::Exception);
}

#[tokio::test]
async fn test_unhandled_rejection() {
    let report = Engine::new()
        .script("Promise.reject(new Error('nope')); console.log('after')")
        .await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.error.as_deref(), Some("Error: nope"));
    assert_eq!(report.lines(MessageType::Log), vec!["after"]);
}

#[tokio::test]
async fn test_timers() {
    let report = Engine::new()
        .script(
            r#"
            await new Promise((resolve) => {
                let ticks = 0;
                const id = setInterval(() => {
                    console.log('tick', ++ticks);
                    if (ticks === 3) { clearInterval(id); resolve(); }
                }, 10);
            });
            "#,
        )
        .await;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.lines(MessageType::Log), vec!["tick 1", "tick 2", "tick 3"]);
}

#[tokio::test]
async fn test_test_harness() {
    let report = Engine::new()
        .run(SubmitJob {
            testing: true,
            ..SubmitJob::new(
                r#"
                test('adds', () => expect(1 + 1).toBe(2));
                test('fails', () => expect([1]).toEqual([2]));
                test.skip('later', () => {});
                "#,
            )
        })
        .await;

    assert_eq!(report.status, JobStatus::Completed);
    let reports: Vec<_> = report
        .messages
        .iter()
        .filter_map(|m| m.test_report())
        .map(|r| (r.name, r.status))
        .collect();
    assert_eq!(
        reports,
        vec![
            ("adds".to_string(), TestStatus::Running),
            ("adds".to_string(), TestStatus::Passed),
            ("fails".to_string(), TestStatus::Running),
            ("fails".to_string(), TestStatus::Failed),
            ("later".to_string(), TestStatus::Skipped),
        ]
    );
}

#[tokio::test]
async fn test_streaming_preserves_output_before_timeout() {
    let engine = Engine::new();
    let id = engine
        .orchestrator
        .submit(SubmitJob {
            timeout_ms: Some(500),
            ..SubmitJob::new("console.log('first'); await new Promise(() => setInterval(() => {}, 5))")
        })
        .unwrap();

    let messages: Vec<Message> = engine.orchestrator.execute(&id).unwrap().collect().await;
    assert_eq!(messages[0].text(), Some("first"));
    let report = messages.last().unwrap().status_report().unwrap();
    assert_eq!(report.status, JobStatus::Timeout);
}
