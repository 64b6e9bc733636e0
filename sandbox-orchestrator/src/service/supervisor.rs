//! Worker supervision
//!
//! One supervisor task per executed job. It owns the worker process from
//! spawn to reap and is the only writer of the job's message stream. The
//! stream always ends with exactly one terminal status unless the consumer
//! went away first: whatever the worker does not report itself (a crash, a
//! timeout, a cancel, a failed spawn) is synthesized here.

use sandbox_core::domain::message::{Message, MessageType, StatusReport, UNEXPECTED_TERMINATION};
use sandbox_core::protocol::{self, ProtocolError, WorkerRequest};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::job::{CANCELLED, JobRegistry};
use crate::config::Config;

/// How long remaining stdout is read after the worker exits
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How long the worker may linger after closing stdout
const EXIT_TIMEOUT: Duration = Duration::from_secs(2);

enum Forward {
    Continue,
    Terminal(StatusReport),
    Gone,
}

/// A decoded worker message waiting for room in the stream
struct Accepted {
    message: Message,
    terminal: Option<StatusReport>,
}

/// How supervision ended
enum Outcome {
    /// The worker sent its own terminal status
    Relayed(StatusReport),
    /// The terminal status still has to be sent
    Synthesized(StatusReport),
    /// Nobody is listening
    Abandoned,
}

/// Forwards worker messages to the consumer
///
/// Rewrites job ids, keeps message ids strictly increasing and remembers
/// what it has seen so a missing terminal status can be inferred.
struct Relay {
    job_id: String,
    tx: mpsc::Sender<Message>,
    last_id: u64,
    saw_complete: bool,
    first_exception: Option<String>,
}

impl Relay {
    fn new(job_id: String, tx: mpsc::Sender<Message>) -> Self {
        Self {
            job_id,
            tx,
            last_id: 0,
            saw_complete: false,
            first_exception: None,
        }
    }

    fn closed(&self) -> impl Future<Output = ()> + '_ {
        self.tx.closed()
    }

    /// Decodes a worker line into the message to relay next
    ///
    /// The message id is fixed here but only counted once the message is
    /// actually sent.
    fn accept(&mut self, line: &str) -> Option<Accepted> {
        let mut message = match protocol::decode_message(line) {
            Ok(message) => message,
            Err(ProtocolError::Empty) => return None,
            Err(err) => {
                warn!(job_id = %self.job_id, "Dropping malformed worker output: {}", err);
                return None;
            }
        };

        let terminal = message.status_report().filter(|r| r.status.is_terminal());
        if message.message_type == MessageType::Status && terminal.is_none() {
            debug!(job_id = %self.job_id, "Dropping non-terminal status from worker");
            return None;
        }

        match message.message_type {
            MessageType::Complete => self.saw_complete = true,
            MessageType::Exception if self.first_exception.is_none() => {
                self.first_exception = message.exception().map(|e| e.to_string());
            }
            _ => {}
        }

        message.job_id = self.job_id.clone();
        if message.message_id <= self.last_id {
            warn!(
                job_id = %self.job_id,
                "Renumbering out-of-order message id {} after {}",
                message.message_id,
                self.last_id
            );
            message.message_id = self.last_id + 1;
        }

        Some(Accepted { message, terminal })
    }

    /// Counts a message handed to the consumer
    fn sent(&mut self, message_id: u64, terminal: Option<StatusReport>) -> Forward {
        self.last_id = message_id;
        match terminal {
            Some(report) => Forward::Terminal(report),
            None => Forward::Continue,
        }
    }

    /// Sends an accepted message, waiting for room in the stream
    async fn send(&mut self, accepted: Accepted) -> Forward {
        let Accepted { message, terminal } = accepted;
        let message_id = message.message_id;
        if self.tx.send(message).await.is_err() {
            return Forward::Gone;
        }
        self.sent(message_id, terminal)
    }

    async fn forward(&mut self, line: &str) -> Forward {
        match self.accept(line) {
            Some(accepted) => self.send(accepted).await,
            None => Forward::Continue,
        }
    }

    /// Status for a worker that exited without sending one
    fn fallback(&self, exit: &str) -> StatusReport {
        if !self.saw_complete {
            return StatusReport::failed(format!("{} ({})", UNEXPECTED_TERMINATION, exit));
        }

        match &self.first_exception {
            Some(error) => StatusReport::failed(error.clone()),
            None => StatusReport::completed(),
        }
    }

    async fn finish(&mut self, report: &StatusReport) {
        self.last_id += 1;
        let message = Message::status(&self.job_id, self.last_id, report);
        if self.tx.send(message).await.is_err() {
            debug!(job_id = %self.job_id, "Consumer left before the terminal status");
        }
    }
}

/// Runs jobs in worker processes
#[derive(Clone)]
pub(crate) struct Supervisor {
    config: Arc<Config>,
    registry: JobRegistry,
    permits: Arc<Semaphore>,
}

impl Supervisor {
    pub(crate) fn new(config: Arc<Config>, registry: JobRegistry, permits: Arc<Semaphore>) -> Self {
        Self {
            config,
            registry,
            permits,
        }
    }

    /// Supervises one job to the end
    pub(crate) async fn run(
        self,
        request: WorkerRequest,
        timeout: Duration,
        tx: mpsc::Sender<Message>,
        cancel: oneshot::Receiver<()>,
    ) {
        let job_id = request.job_id.clone();
        let mut relay = Relay::new(job_id.clone(), tx);

        // Resolves only on an explicit cancel, never when the sender is dropped
        let cancelled = async move {
            if cancel.await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        tokio::pin!(cancelled);

        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.ok(),
            _ = relay.closed() => {
                self.record(&job_id, &StatusReport::failed(CANCELLED));
                return;
            }
            _ = &mut cancelled => {
                self.conclude(&job_id, &mut relay, Outcome::Synthesized(StatusReport::failed(CANCELLED)))
                    .await;
                return;
            }
        };
        let Some(permit) = permit else {
            let outcome = Outcome::Synthesized(StatusReport::failed("orchestrator is shutting down"));
            self.conclude(&job_id, &mut relay, outcome).await;
            return;
        };

        let dir = self.config.work_dir.join(&job_id);
        let outcome = match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => {
                let outcome = self
                    .supervise(&request, &dir, timeout, &mut relay, &mut cancelled)
                    .await;
                remove_job_dir(&dir).await;
                outcome
            }
            Err(err) => Outcome::Synthesized(StatusReport::failed(format!(
                "failed to create job directory: {}",
                err
            ))),
        };
        drop(permit);

        self.conclude(&job_id, &mut relay, outcome).await;
    }

    async fn supervise(
        &self,
        request: &WorkerRequest,
        dir: &Path,
        timeout: Duration,
        relay: &mut Relay,
        cancelled: &mut Pin<&mut impl Future<Output = ()>>,
    ) -> Outcome {
        let job_id = request.job_id.as_str();

        let line = match protocol::encode_request(request) {
            Ok(line) => line,
            Err(err) => {
                return Outcome::Synthesized(StatusReport::failed(format!(
                    "failed to encode worker request: {}",
                    err
                )));
            }
        };

        let mut child = match spawn_worker(&self.config.worker_bin, dir) {
            Ok(child) => child,
            Err(err) => {
                warn!(job_id, "Failed to spawn worker: {}", err);
                return Outcome::Synthesized(StatusReport::failed(format!(
                    "failed to spawn worker: {}",
                    err
                )));
            }
        };

        info!(job_id, pid = child.id(), "Worker started");
        self.registry.mark_running(job_id);

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(line.as_bytes()).await {
                // The worker died early; its exit is handled below
                warn!(job_id, "Failed to write worker request: {}", err);
            }
            drop(stdin);
        }

        if let Some(stderr) = child.stderr.take() {
            let job_id = job_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job_id = %job_id, "worker: {}", line);
                }
            });
        }

        let Some(stdout) = child.stdout.take() else {
            stop(&mut child, job_id).await;
            return Outcome::Synthesized(StatusReport::failed("worker stdout unavailable"));
        };
        let mut lines = BufReader::new(stdout).lines();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        // At most one message is held back while the stream is full, and
        // stdout is not read meanwhile so the worker stalls on its pipe
        let mut pending: Option<Accepted> = None;
        let tx = relay.tx.clone();

        loop {
            tokio::select! {
                permit = tx.reserve(), if pending.is_some() => {
                    let (Ok(permit), Some(accepted)) = (permit, pending.take()) else {
                        stop(&mut child, job_id).await;
                        return Outcome::Abandoned;
                    };
                    let Accepted { message, terminal } = accepted;
                    let message_id = message.message_id;
                    permit.send(message);

                    if let Forward::Terminal(report) = relay.sent(message_id, terminal) {
                        stop(&mut child, job_id).await;
                        return Outcome::Relayed(report);
                    }
                }
                line = lines.next_line(), if pending.is_none() => match line {
                    Ok(Some(line)) => pending = relay.accept(&line),
                    Ok(None) | Err(_) => {
                        let exit = match tokio::time::timeout(EXIT_TIMEOUT, child.wait()).await {
                            Ok(Ok(status)) => status.to_string(),
                            Ok(Err(err)) => err.to_string(),
                            Err(_) => {
                                stop(&mut child, job_id).await;
                                "stdout closed while the process kept running".to_string()
                            }
                        };
                        return Outcome::Synthesized(relay.fallback(&exit));
                    }
                },
                status = child.wait() => {
                    let exit = match status {
                        Ok(status) => status.to_string(),
                        Err(err) => err.to_string(),
                    };
                    return drain(&mut lines, relay, pending.take(), &exit).await;
                }
                _ = &mut deadline => {
                    info!(job_id, "Job timed out after {:?}", timeout);
                    stop(&mut child, job_id).await;
                    return Outcome::Synthesized(StatusReport::timeout());
                }
                _ = relay.closed() => {
                    info!(job_id, "Consumer disconnected, stopping worker");
                    stop(&mut child, job_id).await;
                    return Outcome::Abandoned;
                }
                _ = cancelled.as_mut() => {
                    info!(job_id, "Job cancelled");
                    stop(&mut child, job_id).await;
                    return Outcome::Synthesized(StatusReport::failed(CANCELLED));
                }
            }
        }
    }

    /// Sends the terminal status if still owed and records the job's end
    ///
    /// The job is recorded first: a consumer that stopped reading may keep
    /// the last send waiting.
    async fn conclude(&self, job_id: &str, relay: &mut Relay, outcome: Outcome) {
        match outcome {
            Outcome::Relayed(report) => self.record(job_id, &report),
            Outcome::Synthesized(report) => {
                self.record(job_id, &report);
                relay.finish(&report).await;
            }
            Outcome::Abandoned => self.record(job_id, &StatusReport::failed(CANCELLED)),
        }
    }

    fn record(&self, job_id: &str, report: &StatusReport) {
        info!(job_id, "Job finished with status: {}", report.status);
        self.registry
            .finish(job_id, report.status, report.error.clone());
    }
}

fn spawn_worker(worker_bin: &Path, dir: &Path) -> std::io::Result<Child> {
    Command::new(worker_bin)
        .env_clear()
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Reads what the worker wrote before exiting, for a bounded time
async fn drain(
    lines: &mut Lines<BufReader<ChildStdout>>,
    relay: &mut Relay,
    pending: Option<Accepted>,
    exit: &str,
) -> Outcome {
    let read = async {
        if let Some(accepted) = pending {
            match relay.send(accepted).await {
                Forward::Continue => {}
                Forward::Terminal(report) => return Some(Outcome::Relayed(report)),
                Forward::Gone => return Some(Outcome::Abandoned),
            }
        }
        while let Ok(Some(line)) = lines.next_line().await {
            match relay.forward(&line).await {
                Forward::Continue => {}
                Forward::Terminal(report) => return Some(Outcome::Relayed(report)),
                Forward::Gone => return Some(Outcome::Abandoned),
            }
        }
        None
    };

    match tokio::time::timeout(DRAIN_TIMEOUT, read).await {
        Ok(Some(outcome)) => outcome,
        Ok(None) | Err(_) => Outcome::Synthesized(relay.fallback(exit)),
    }
}

/// Kills the worker and reaps it
async fn stop(child: &mut Child, job_id: &str) {
    if let Err(err) = child.kill().await {
        debug!(job_id, "Failed to kill worker: {}", err);
    }
}

async fn remove_job_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("Failed to remove job directory {}: {}", dir.display(), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_core::domain::job::JobStatus;
    use serde_json::json;

    fn line(message: &Message) -> String {
        protocol::encode_message(message).unwrap()
    }

    #[tokio::test]
    async fn test_relay_rewrites_ids() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut relay = Relay::new("job".to_string(), tx);

        relay
            .forward(&line(&Message::new("other", 1, MessageType::Log, json!("a"))))
            .await;
        relay
            .forward(&line(&Message::new("other", 1, MessageType::Log, json!("b"))))
            .await;
        relay.finish(&StatusReport::completed()).await;

        let ids: Vec<(String, u64)> = [rx.recv().await, rx.recv().await, rx.recv().await]
            .into_iter()
            .flatten()
            .map(|m| (m.job_id, m.message_id))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("job".to_string(), 1),
                ("job".to_string(), 2),
                ("job".to_string(), 3)
            ]
        );
    }

    #[tokio::test]
    async fn test_relay_skips_noise_and_running_status() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut relay = Relay::new("job".to_string(), tx);

        let running = Message::new("job", 1, MessageType::Status, json!({"status": "running"}));
        assert!(matches!(relay.forward("").await, Forward::Continue));
        assert!(matches!(relay.forward("not json").await, Forward::Continue));
        assert!(matches!(relay.forward(&line(&running)).await, Forward::Continue));

        let done = Message::status("job", 2, &StatusReport::completed());
        assert!(matches!(
            relay.forward(&line(&done)).await,
            Forward::Terminal(StatusReport { status: JobStatus::Completed, .. })
        ));
        assert_eq!(rx.recv().await.map(|m| m.message_id), Some(2));
    }

    #[tokio::test]
    async fn test_fallback_status() {
        let (tx, _rx) = mpsc::channel(8);
        let mut relay = Relay::new("job".to_string(), tx);

        let report = relay.fallback("exit status: 3");
        assert_eq!(
            report.error.as_deref(),
            Some("worker terminated unexpectedly (exit status: 3)")
        );

        relay
            .forward(&line(&Message::new("job", 1, MessageType::Complete, json!("bye"))))
            .await;
        assert_eq!(relay.fallback("exit status: 0"), StatusReport::completed());

        let exception = json!({"name": "Error", "message": "boom"});
        relay
            .forward(&line(&Message::new("job", 2, MessageType::Exception, exception)))
            .await;
        assert_eq!(
            relay.fallback("exit status: 0"),
            StatusReport::failed("Error: boom")
        );
    }

    #[tokio::test]
    async fn test_forward_to_dropped_consumer() {
        let (tx, rx) = mpsc::channel(8);
        let mut relay = Relay::new("job".to_string(), tx);
        drop(rx);

        let message = Message::new("job", 1, MessageType::Log, json!("lost"));
        assert!(matches!(relay.forward(&line(&message)).await, Forward::Gone));
    }
}
