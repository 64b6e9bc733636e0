//! Worker configuration
//!
//! The worker is spawned with a cleared environment, so every setting has a
//! default that works without any variable set.

use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Added to the job timeout to get the worker's own deadline, so that
    /// the host's timer normally fires first
    pub deadline_grace: Duration,

    /// Used when a request carries no timeout
    pub default_timeout: Duration,

    /// Reported to scripts as `process.cwd()`, and the root of `fs`
    pub work_dir: PathBuf,
}

impl Config {
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            deadline_grace: Duration::from_millis(1_000),
            default_timeout: Duration::from_secs(30),
            work_dir,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - SANDBOX_WORKER_DEADLINE_GRACE_MS (optional, default: 1000)
    /// - SANDBOX_WORKER_DEFAULT_TIMEOUT_MS (optional, default: 30000)
    ///
    /// The working directory is the one the worker was started in.
    pub fn from_env() -> anyhow::Result<Self> {
        let work_dir = std::env::current_dir()
            .map_err(|e| anyhow::anyhow!("Failed to read working directory: {}", e))?;

        let mut config = Self::new(work_dir);

        if let Some(grace) = read_millis("SANDBOX_WORKER_DEADLINE_GRACE_MS") {
            config.deadline_grace = grace;
        }
        if let Some(timeout) = read_millis("SANDBOX_WORKER_DEFAULT_TIMEOUT_MS") {
            config.default_timeout = timeout;
        }

        Ok(config)
    }

    /// Timeout for a request, falling back to the default when it has none
    pub fn timeout_for(&self, timeout_ms: u64) -> Duration {
        if timeout_ms == 0 {
            self.default_timeout
        } else {
            Duration::from_millis(timeout_ms)
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_timeout.is_zero() {
            anyhow::bail!("default_timeout must be greater than 0");
        }

        if !self.work_dir.is_absolute() {
            anyhow::bail!("work_dir must be an absolute path");
        }

        if self.work_dir.parent().is_none() {
            anyhow::bail!("work_dir must not be the filesystem root");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("sandbox-worker"))
    }
}

fn read_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}
