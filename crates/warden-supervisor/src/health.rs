//! HTTP readiness check for supervised services.

use std::time::Duration;

use tracing::trace;

/// Upper bound on a single health request.
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    /// The endpoint answered 200.
    Ready,
    /// The endpoint answered with another status.
    Status(u16),
    /// Connection refused, reset, or timed out.
    Unreachable(String),
}

impl HealthOutcome {
    /// True when the endpoint answered 200.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Client that checks whether a loopback service answers its health endpoint.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    client: reqwest::Client,
}

impl HealthCheck {
    /// Create a client with a short per-request timeout that bypasses proxies.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(CHECK_TIMEOUT)
            .no_proxy()
            .build()
            .expect("Invalid HTTP client configuration");
        Self { client }
    }

    /// Issue one GET against `url`.
    pub async fn check(&self, url: &str) -> HealthOutcome {
        match self.client.get(url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => HealthOutcome::Ready,
            Ok(response) => {
                trace!("Health check {} answered {}", url, response.status());
                HealthOutcome::Status(response.status().as_u16())
            }
            Err(e) => {
                trace!("Health check {} failed: {}", url, e);
                HealthOutcome::Unreachable(e.to_string())
            }
        }
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a loopback URL for `path` on `port`.
pub fn loopback_url(port: u16, path: &str) -> String {
    format!("http://127.0.0.1:{}{}", port, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{free_port, StubServer};

    #[test]
    fn test_loopback_url() {
        assert_eq!(loopback_url(9000, "/health"), "http://127.0.0.1:9000/health");
    }

    #[tokio::test]
    async fn test_health_outcomes() {
        let server = StubServer::start().await;
        server.route("/health", 200, "ok");
        server.route("/busy", 503, "loading");

        let health = HealthCheck::new();
        assert_eq!(health.check(&server.url("/health")).await, HealthOutcome::Ready);
        assert_eq!(
            health.check(&server.url("/busy")).await,
            HealthOutcome::Status(503)
        );

        let closed = loopback_url(free_port(), "/health");
        assert!(matches!(
            health.check(&closed).await,
            HealthOutcome::Unreachable(_)
        ));
    }
}
