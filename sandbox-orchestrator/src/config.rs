//! Orchestrator configuration
//!
//! Server, worker and limit settings. Every value has a default so the
//! orchestrator can start with no environment at all; `from_env` overrides
//! the defaults from `SANDBOX_*` variables.

use sandbox_core::protocol::ResourceLimits;
use std::path::PathBuf;
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server listens on
    pub bind_addr: String,

    /// Path of the worker executable
    pub worker_bin: PathBuf,

    /// Timeout of jobs that do not set their own
    pub job_timeout: Duration,

    /// Ceiling for the timeout a job may ask for
    pub max_job_timeout: Duration,

    /// How long an SSE stream stays open after the terminal status
    pub stream_grace: Duration,

    /// Workers allowed to run at the same time
    pub max_concurrent_jobs: usize,

    /// Largest accepted script, in bytes
    pub max_script_bytes: usize,

    /// Payload bytes a buffered run collects before the job is stopped
    pub max_buffered_bytes: usize,

    /// Engine limits handed to every worker
    pub limits: ResourceLimits,

    /// Parent of the per-job working directories
    pub work_dir: PathBuf,

    /// Host variables copied into each job's environment snapshot
    pub env_allow: Vec<String>,

    /// Lets scripts reach the network through `fetch`
    pub allow_network: bool,
}

impl Config {
    /// Creates a configuration with defaults for the given worker binary
    pub fn new(worker_bin: PathBuf) -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            worker_bin,
            job_timeout: Duration::from_secs(30),
            max_job_timeout: Duration::from_secs(300),
            stream_grace: Duration::from_millis(250),
            max_concurrent_jobs: 16,
            max_script_bytes: 1024 * 1024,
            max_buffered_bytes: 16 * 1024 * 1024,
            limits: ResourceLimits::default(),
            work_dir: std::env::temp_dir().join("sandbox-jobs"),
            env_allow: Vec::new(),
            allow_network: false,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - SANDBOX_BIND_ADDR (optional, default: 0.0.0.0:8080)
    /// - SANDBOX_WORKER_BIN (optional, default: `sandbox-worker` next to this executable)
    /// - SANDBOX_JOB_TIMEOUT_MS (optional, default: 30000)
    /// - SANDBOX_MAX_JOB_TIMEOUT_MS (optional, default: 300000)
    /// - SANDBOX_STREAM_GRACE_MS (optional, default: 250)
    /// - SANDBOX_MAX_CONCURRENT_JOBS (optional, default: 16)
    /// - SANDBOX_MAX_SCRIPT_BYTES (optional, default: 1048576)
    /// - SANDBOX_MAX_BUFFERED_BYTES (optional, default: 16777216)
    /// - SANDBOX_MEMORY_LIMIT_BYTES (optional, default: 67108864)
    /// - SANDBOX_STACK_LIMIT_BYTES (optional, default: 1048576)
    /// - SANDBOX_WORK_DIR (optional, default: `<tmp>/sandbox-jobs`)
    /// - SANDBOX_ENV_ALLOW (optional, comma-separated variable names)
    /// - SANDBOX_ALLOW_NETWORK (optional, `true` or `false`, default: false)
    pub fn from_env() -> anyhow::Result<Self> {
        let worker_bin = match std::env::var("SANDBOX_WORKER_BIN") {
            Ok(path) => PathBuf::from(path),
            Err(_) => default_worker_bin()?,
        };

        let mut config = Self::new(worker_bin);

        if let Ok(addr) = std::env::var("SANDBOX_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(ms) = read_parsed::<u64>("SANDBOX_JOB_TIMEOUT_MS")? {
            config.job_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_parsed::<u64>("SANDBOX_MAX_JOB_TIMEOUT_MS")? {
            config.max_job_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_parsed::<u64>("SANDBOX_STREAM_GRACE_MS")? {
            config.stream_grace = Duration::from_millis(ms);
        }
        if let Some(n) = read_parsed("SANDBOX_MAX_CONCURRENT_JOBS")? {
            config.max_concurrent_jobs = n;
        }
        if let Some(n) = read_parsed("SANDBOX_MAX_SCRIPT_BYTES")? {
            config.max_script_bytes = n;
        }
        if let Some(n) = read_parsed("SANDBOX_MAX_BUFFERED_BYTES")? {
            config.max_buffered_bytes = n;
        }
        if let Some(n) = read_parsed("SANDBOX_MEMORY_LIMIT_BYTES")? {
            config.limits.memory_limit_bytes = n;
        }
        if let Some(n) = read_parsed("SANDBOX_STACK_LIMIT_BYTES")? {
            config.limits.max_stack_bytes = n;
        }
        if let Ok(dir) = std::env::var("SANDBOX_WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        if let Ok(list) = std::env::var("SANDBOX_ENV_ALLOW") {
            config.env_allow = parse_allow_list(&list);
        }
        if let Some(allow) = read_parsed::<bool>("SANDBOX_ALLOW_NETWORK")? {
            config.allow_network = allow;
        }

        Ok(config)
    }

    /// Timeout for a job, preferring the job's own when it sets one
    ///
    /// A requested timeout never exceeds `max_job_timeout`.
    pub fn timeout_for(&self, timeout_ms: Option<u64>) -> Duration {
        match timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms).min(self.max_job_timeout),
            _ => self.job_timeout,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.job_timeout.is_zero() {
            anyhow::bail!("job_timeout must be greater than 0");
        }

        if self.job_timeout > self.max_job_timeout {
            anyhow::bail!("job_timeout must not exceed max_job_timeout");
        }

        if self.max_concurrent_jobs == 0 {
            anyhow::bail!("max_concurrent_jobs must be greater than 0");
        }

        if self.max_script_bytes == 0 {
            anyhow::bail!("max_script_bytes must be greater than 0");
        }

        if self.max_buffered_bytes == 0 {
            anyhow::bail!("max_buffered_bytes must be greater than 0");
        }

        if self.limits.memory_limit_bytes < 1024 * 1024 {
            anyhow::bail!("memory limit must be at least 1 MiB");
        }

        if self.limits.max_stack_bytes < 64 * 1024 {
            anyhow::bail!("stack limit must be at least 64 KiB");
        }

        if self.worker_bin.as_os_str().is_empty() {
            anyhow::bail!("worker_bin must not be empty");
        }

        Ok(())
    }
}

/// The worker binary installed alongside the running executable
fn default_worker_bin() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| anyhow::anyhow!("Failed to locate current executable: {}", e))?;
    Ok(exe.with_file_name(format!("sandbox-worker{}", std::env::consts::EXE_SUFFIX)))
}

fn read_parsed<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", name, value)),
        Err(_) => Ok(None),
    }
}

fn parse_allow_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new(PathBuf::from("/usr/local/bin/sandbox-worker"))
    }

    #[test]
    fn test_default_config() {
        let config = config();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.job_timeout, Duration::from_secs(30));
        assert_eq!(config.stream_grace, Duration::from_millis(250));
        assert_eq!(config.max_concurrent_jobs, 16);
        assert_eq!(config.max_script_bytes, 1024 * 1024);
        assert_eq!(config.max_buffered_bytes, 16 * 1024 * 1024);
        assert_eq!(config.limits, ResourceLimits::default());
        assert!(config.env_allow.is_empty());
        assert!(!config.allow_network);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_override() {
        let config = config();
        assert_eq!(config.timeout_for(None), Duration::from_secs(30));
        assert_eq!(config.timeout_for(Some(0)), Duration::from_secs(30));
        assert_eq!(config.timeout_for(Some(1500)), Duration::from_millis(1500));
    }

    #[test]
    fn test_timeout_ceiling() {
        let mut config = config();
        assert_eq!(config.max_job_timeout, Duration::from_secs(300));
        assert_eq!(config.timeout_for(Some(u64::MAX)), Duration::from_secs(300));

        config.max_job_timeout = Duration::from_secs(2);
        assert_eq!(config.timeout_for(Some(2001)), Duration::from_secs(2));
        assert_eq!(config.timeout_for(Some(1999)), Duration::from_millis(1999));
        assert!(config.validate().is_err());

        config.job_timeout = Duration::from_secs(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_allow_list_parsing() {
        assert_eq!(parse_allow_list("HOME, LANG,,TZ "), vec!["HOME", "LANG", "TZ"]);
        assert!(parse_allow_list(" , ").is_empty());
    }

    #[test]
    fn test_config_validation() {
        let mut config = config();

        config.job_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config.job_timeout = Duration::from_secs(1);
        config.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());

        config.max_concurrent_jobs = 1;
        config.max_buffered_bytes = 0;
        assert!(config.validate().is_err());

        config.max_buffered_bytes = 1024;
        config.limits.memory_limit_bytes = 1024;
        assert!(config.validate().is_err());

        config.limits = ResourceLimits::default();
        config.worker_bin = PathBuf::new();
        assert!(config.validate().is_err());
    }
}
