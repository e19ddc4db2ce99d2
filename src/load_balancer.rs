use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::{Duration, interval};
use tracing::{info, warn};

use generation_gateway::ConfigError;

// Single inference backend

pub struct Backend {
    pub url: String,
    healthy: AtomicBool,
}

impl Backend {
    pub fn new(url: String) -> Self {
        Self {
            url,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

#[derive(Serialize)]
pub struct BackendStatus {
    pub url: String,
    pub healthy: bool,
}

// Round-robin over the inference backends

pub struct LoadBalancer {
    backends: Vec<Arc<Backend>>,
    current: AtomicUsize,
}

impl LoadBalancer {
    // Create from comma-separated urls "localhost:11434, localhost:11435"
    pub fn new(backends_str: &str) -> Result<Self, ConfigError> {
        let backends: Vec<Arc<Backend>> = backends_str
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|url| {
                // add http:// if not present
                let full_url = if url.starts_with("http") {
                    url.to_string()
                } else {
                    format!("http://{}", url)
                };
                Arc::new(Backend::new(full_url))
            })
            .collect();
        if backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }

        for (i, b) in backends.iter().enumerate() {
            info!(index = i + 1, url = %b.url, "registered backend");
        }

        Ok(Self {
            backends,
            current: AtomicUsize::new(0),
        })
    }

    // Next healthy backend (round-robin)
    pub fn get_backend(&self) -> Option<Arc<Backend>> {
        let len = self.backends.len();
        let start = self.current.fetch_add(1, Ordering::Relaxed) % len;

        (0..len)
            .map(|i| &self.backends[(start + i) % len])
            .find(|b| b.is_healthy())
            .map(Arc::clone)
    }

    pub fn all_backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn status(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .map(|b| BackendStatus {
                url: b.url.clone(),
                healthy: b.is_healthy(),
            })
            .collect()
    }
}

// Periodic health probe against the backends' model listing

pub async fn health_checker(
    load_balancer: Arc<LoadBalancer>,
    client: reqwest::Client,
    check_interval: Duration,
) {
    let mut interval = interval(check_interval);

    info!(interval_secs = check_interval.as_secs(), "health checker started");

    loop {
        interval.tick().await;

        for backend in load_balancer.all_backends() {
            let url = format!("{}/api/tags", backend.url);

            let was_healthy = backend.is_healthy();

            let is_healthy = match client.get(&url).timeout(Duration::from_secs(5)).send().await {
                Ok(res) => res.status().is_success(),
                Err(_) => false,
            };
            backend.set_healthy(is_healthy);

            // Log status changes
            if was_healthy != is_healthy {
                if is_healthy {
                    info!(url = %backend.url, "backend is now healthy");
                } else {
                    warn!(url = %backend.url, "backend is now unhealthy");
                }
            }
        }
    }
}
