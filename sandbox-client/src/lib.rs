//! Sandbox HTTP Client
//!
//! A typed client for the sandbox orchestrator API, used by the CLI and by
//! integration tests.
//!
//! # Example
//!
//! ```no_run
//! use sandbox_client::SandboxClient;
//! use sandbox_core::dto::job::SubmitJob;
//!
//! # async fn example() -> sandbox_client::Result<()> {
//! let client = SandboxClient::new("http://localhost:8080");
//!
//! let report = client.run(SubmitJob::new("console.log('hi')")).await?;
//! println!("{}: {:?}", report.status, report.messages);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod events;
mod jobs;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use events::EventStream;

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the sandbox orchestrator API
#[derive(Debug, Clone)]
pub struct SandboxClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl SandboxClient {
    /// Create a new client
    ///
    /// # Example
    /// ```
    /// use sandbox_client::SandboxClient;
    ///
    /// let client = SandboxClient::new("http://localhost:8080/");
    /// assert_eq!(client.base_url(), "http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    /// Avoid a total request timeout shorter than your longest job when
    /// streaming events.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Fails with an API error unless the response is a success
    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response)
    }

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        self.check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content (e.g., DELETE operations)
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        self.check(response).await.map(|_| ())
    }
}
