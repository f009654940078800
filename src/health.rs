//! MCP server reachability: raw port probe plus the `/health` endpoint.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoffBuilder;
use reqwest::Client;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Response from the health endpoint.
#[derive(Debug, Clone)]
pub struct HealthResponse {
    pub status: u16,
    pub body: String,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Result of probing the server.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub host: String,
    pub port: u16,
    pub port_open: bool,
    pub health: Option<HealthResponse>,
    pub error: Option<String>,
    pub attempts: u32,
}

impl ProbeReport {
    pub fn is_ready(&self) -> bool {
        self.port_open && self.health.as_ref().is_some_and(HealthResponse::is_healthy)
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== MCP Server {}:{} ===", self.host, self.port)?;
        writeln!(f, "Port:     {}", if self.port_open { "OPEN" } else { "CLOSED" })?;
        match &self.health {
            Some(h) => {
                writeln!(f, "Health:   HTTP {}", h.status)?;
                if !h.body.is_empty() {
                    writeln!(f, "Body:     {}", h.body.trim())?;
                }
            }
            None => writeln!(f, "Health:   no response")?,
        }
        if let Some(e) = &self.error {
            writeln!(f, "Error:    {}", e)?;
        }
        writeln!(f, "Attempts: {}", self.attempts)?;
        writeln!(f, "Ready:    {}", if self.is_ready() { "Yes" } else { "No" })?;
        Ok(())
    }
}

/// Probes one MCP server endpoint.
pub struct HealthProbe {
    client: Client,
    host: String,
    port: u16,
}

impl HealthProbe {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let client = Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            host: host.into(),
            port,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Whether something accepts TCP connections on the port.
    pub async fn port_open(&self) -> bool {
        let addr = (self.host.as_str(), self.port);
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(port = self.port, error = %e, "Port closed");
                false
            }
            Err(_) => {
                debug!(port = self.port, "Port probe timed out");
                false
            }
        }
    }

    /// `GET /health`.
    pub async fn check_health(&self) -> Result<HealthResponse> {
        let url = format!("{}/health", self.base_url());
        debug!(url = %url, "Checking health endpoint");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Health request failed")?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(HealthResponse { status, body })
    }

    /// One probe: port first, then the health endpoint if the port is open.
    pub async fn probe(&self) -> ProbeReport {
        let mut report = ProbeReport {
            host: self.host.clone(),
            port: self.port,
            port_open: false,
            health: None,
            error: None,
            attempts: 1,
        };

        report.port_open = self.port_open().await;
        if !report.port_open {
            report.error = Some(format!("port {} is not open", self.port));
            return report;
        }

        match self.check_health().await {
            Ok(health) => {
                if !health.is_healthy() {
                    report.error = Some(format!("health endpoint returned {}", health.status));
                }
                report.health = Some(health);
            }
            Err(e) => report.error = Some(format!("{:#}", e)),
        }

        report
    }

    /// Probe up to `attempts` times, `delay` apart, until the server is ready.
    pub async fn wait_until_ready(&self, attempts: u32, delay: Duration) -> ProbeReport {
        let attempts = attempts.max(1);
        let counter = AtomicU32::new(0);

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(delay)
            .with_multiplier(1.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        let result = backoff::future::retry(policy, || async {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let mut report = self.probe().await;
            report.attempts = attempt;

            if report.is_ready() {
                return Ok(report);
            }

            debug!(
                attempt = attempt,
                max = attempts,
                error = report.error.as_deref().unwrap_or(""),
                "MCP server not ready"
            );

            if attempt >= attempts {
                Err(backoff::Error::permanent(report))
            } else {
                Err(backoff::Error::transient(report))
            }
        })
        .await;

        match result {
            Ok(report) => {
                info!(port = self.port, attempts = report.attempts, "MCP server is ready");
                report
            }
            Err(report) => {
                warn!(port = self.port, attempts = report.attempts, "MCP server not ready");
                report
            }
        }
    }
}
