//! Fake workers for orchestrator tests
//!
//! Each fake is a small shell script standing in for the worker binary: it
//! reads the request line and prints hand-written protocol messages.

#![allow(dead_code)]

use sandbox_orchestrator::{Config, JobOrchestrator};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

const PRELUDE: &str = r#"#!/bin/sh
PATH=/usr/bin:/bin
emit() {
  printf '{"job_id":"fake","message_id":%s,"type":"%s","kind":"%s","payload":%s,"timestamp":"2026-01-01T00:00:00Z"}\n' "$1" "$2" "$3" "$4"
}
read -r request
"#;

pub struct Fixture {
    pub orchestrator: JobOrchestrator,
    pub dir: TempDir,
}

impl Fixture {
    /// An orchestrator whose worker runs the given shell body
    pub fn new(body: &str) -> Self {
        Self::with_config(body, |_| {})
    }

    pub fn with_config(body: &str, configure: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let worker = write_worker(dir.path(), body);

        let mut config = Config::new(worker);
        config.work_dir = dir.path().join("jobs");
        config.stream_grace = Duration::from_millis(20);
        configure(&mut config);

        std::fs::create_dir_all(&config.work_dir).unwrap();
        Self {
            orchestrator: JobOrchestrator::new(config),
            dir,
        }
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.orchestrator.config().work_dir.clone()
    }
}

fn write_worker(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-worker");
    std::fs::write(&path, format!("{}{}\n", PRELUDE, body)).unwrap();

    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();
    path
}

/// Worker that logs, completes and reports success
pub const ECHO_WORKER: &str = r#"
emit 1 log info '"hello"'
emit 2 complete completion '"[sandbox] Worker closing..."'
emit 3 status completion '{"status":"completed"}'
"#;

/// Worker that records its pid, floods stdout and then hangs
pub fn flooding_worker(pid_file: &Path, lines: usize) -> String {
    format!(
        r#"
echo $$ > '{}'
i=1
while [ $i -le {} ]; do
  emit $i log info '"line"'
  i=$((i+1))
done
exec sleep 30
"#,
        pid_file.display(),
        lines
    )
}

/// Polls until the process is gone and the job left the registry
pub async fn wait_until_finished(orchestrator: &JobOrchestrator, job_id: &str, pid_file: &Path) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let alive = std::fs::read_to_string(pid_file)
            .map(|pid| Path::new(&format!("/proc/{}", pid.trim())).exists())
            .unwrap_or(true);
        if !alive && orchestrator.get(job_id).is_none() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
