use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::NapperConfig;
use crate::errors::{NapperError, Result};

/// Diagnostic detail for one probe
#[derive(Debug, Clone)]
pub struct HealthInfo {
    pub healthy: bool,
    pub response_time: Duration,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

/// Liveness probe against a managed application.
///
/// Implementations never raise: unreachable, refused, DNS failure, and
/// timeout all come back as unhealthy.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn healthy(&self, host: &str) -> bool;

    async fn health_info(&self, host: &str) -> HealthInfo;

    /// Poll at fixed intervals until healthy or attempts exhausted.
    async fn wait_for_health(&self, host: &str, attempts: u32, delay: Duration) -> bool {
        for attempt in 1..=attempts {
            if self.healthy(host).await {
                return true;
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        false
    }
}

/// HTTP GET probe: healthy iff a response with status < 400 arrives before
/// the deadline. The client timeout covers connect + read.
pub struct HttpHealthChecker {
    client: reqwest::Client,
    port: u16,
    path: String,
}

impl HttpHealthChecker {
    pub fn new(config: &NapperConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.health_check_timeout))
            .build()
            .map_err(|e| NapperError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            port: config.health_check_port,
            path: config.health_check_path.clone(),
        })
    }

    fn url_for(&self, host: &str) -> String {
        format!("http://{}:{}{}", host, self.port, self.path)
    }
}

#[async_trait]
impl HealthProbe for HttpHealthChecker {
    async fn healthy(&self, host: &str) -> bool {
        self.health_info(host).await.healthy
    }

    async fn health_info(&self, host: &str) -> HealthInfo {
        let url = self.url_for(host);
        let started = Instant::now();

        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                HealthInfo {
                    healthy: status < 400,
                    response_time: started.elapsed(),
                    status_code: Some(status),
                    error: None,
                }
            }
            Err(e) => {
                debug!("Health check failed for {}: {}", url, e);
                HealthInfo {
                    healthy: false,
                    response_time: started.elapsed(),
                    status_code: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
