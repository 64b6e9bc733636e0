//! Configuration module
//!
//! Settings shared by every command.

use std::path::PathBuf;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the sandbox server
    pub server_url: String,

    /// Worker binary for local runs; `None` uses the orchestrator's lookup
    pub worker_bin: Option<PathBuf>,
}
