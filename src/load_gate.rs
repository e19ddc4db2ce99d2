//! CPU-pressure admission gate.
//!
//! Sampling is a point-in-time signal: concurrent admissions can race past
//! the gate, so this sheds load on a best-effort basis rather than counting
//! capacity.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::LoadGateConfig;
use crate::error::{AdmissionError, LoadError};
use crate::metrics::CPU_USAGE;

/// Source of system-wide CPU utilisation.
#[async_trait]
pub trait CpuProbe: Send + Sync {
    /// Utilisation in percent, measured over `interval`.
    async fn cpu_percent(&self, interval: Duration) -> Result<f32, LoadError>;
}

/// Reads `/proc/stat` twice and compares the busy share of the deltas.
pub struct ProcStatProbe {
    path: PathBuf,
}

impl Default for ProcStatProbe {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/stat"),
        }
    }
}

impl ProcStatProbe {
    async fn read_times(&self) -> Result<CpuTimes, LoadError> {
        let stat = tokio::fs::read_to_string(&self.path).await?;
        CpuTimes::parse(&stat)
    }
}

#[async_trait]
impl CpuProbe for ProcStatProbe {
    async fn cpu_percent(&self, interval: Duration) -> Result<f32, LoadError> {
        let before = self.read_times().await?;
        sleep(interval).await;
        let after = self.read_times().await?;
        Ok(after.busy_percent_since(&before))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

impl CpuTimes {
    fn parse(stat: &str) -> Result<Self, LoadError> {
        let line = stat
            .lines()
            .find(|l| l.starts_with("cpu "))
            .ok_or_else(|| LoadError::Format("missing aggregate cpu line".into()))?;

        let fields = line
            .split_whitespace()
            .skip(1)
            .map(|v| v.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LoadError::Format(e.to_string()))?;
        if fields.len() < 4 {
            return Err(LoadError::Format(format!(
                "expected at least 4 cpu fields, got {}",
                fields.len()
            )));
        }

        // idle + iowait count as not busy
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        Ok(Self {
            idle,
            total: fields.iter().sum(),
        })
    }

    fn busy_percent_since(&self, earlier: &Self) -> f32 {
        let total = self.total.saturating_sub(earlier.total);
        if total == 0 {
            return 0.0;
        }
        let idle = self.idle.saturating_sub(earlier.idle);
        (total.saturating_sub(idle) as f32 / total as f32) * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadStatus {
    pub current_cpu: f32,
    pub overloaded: bool,
    pub can_proceed: bool,
    pub wait_hint: Option<Duration>,
    pub reason: Option<String>,
}

pub struct LoadGate {
    config: LoadGateConfig,
    probe: Arc<dyn CpuProbe>,
}

impl LoadGate {
    pub fn new(config: LoadGateConfig) -> Self {
        Self::with_probe(config, Arc::new(ProcStatProbe::default()))
    }

    pub fn with_probe(config: LoadGateConfig, probe: Arc<dyn CpuProbe>) -> Self {
        info!(
            cpu_max = config.cpu_max,
            cpu_critical = config.cpu_critical,
            cores = config.cores,
            "load gate initialized"
        );
        Self { config, probe }
    }

    /// Sample the CPU once. Probe failures fail open.
    pub async fn sample(&self) -> LoadStatus {
        match self.read_cpu().await {
            Ok(cpu) => self.status_for(cpu),
            Err(e) => {
                warn!(error = %e, "cpu sampling failed, admitting anyway");
                LoadStatus {
                    current_cpu: 0.0,
                    overloaded: false,
                    can_proceed: true,
                    wait_hint: None,
                    reason: Some(e.to_string()),
                }
            }
        }
    }

    async fn read_cpu(&self) -> Result<f32, LoadError> {
        let cpu = self.probe.cpu_percent(self.config.sample_interval).await?;
        CPU_USAGE.set(f64::from(cpu));
        Ok(cpu)
    }

    pub fn status_for(&self, cpu: f32) -> LoadStatus {
        let overloaded = cpu >= self.config.cpu_critical;
        let can_proceed = cpu < self.config.cpu_max;
        let (wait_hint, reason) = if overloaded {
            (Some(self.config.base_wait * 3), Some("critical CPU usage".to_string()))
        } else if !can_proceed {
            (Some(self.config.base_wait), Some("high CPU usage".to_string()))
        } else {
            (None, None)
        };
        LoadStatus {
            current_cpu: cpu,
            overloaded,
            can_proceed,
            wait_hint,
            reason,
        }
    }

    /// Poll until there is headroom or `max_wait` has elapsed.
    pub async fn acquire(&self, max_wait: Duration) -> Result<LoadStatus, AdmissionError> {
        let start = Instant::now();
        loop {
            let status = self.sample().await;
            if status.can_proceed {
                return Ok(status);
            }

            let waited = start.elapsed();
            if waited >= max_wait {
                warn!(
                    cpu = status.current_cpu,
                    waited_secs = waited.as_secs_f64(),
                    "gave up waiting for cpu headroom"
                );
                return Err(AdmissionError::CapacityUnavailable {
                    waited,
                    cpu: status.current_cpu,
                });
            }

            let pause = status
                .wait_hint
                .unwrap_or(self.config.base_wait)
                .min(max_wait - waited);
            debug!(
                cpu = status.current_cpu,
                reason = status.reason.as_deref().unwrap_or(""),
                pause_ms = pause.as_millis() as u64,
                "waiting for cpu headroom"
            );
            sleep(pause).await;
        }
    }

    pub async fn await_availability(&self, max_wait: Duration) -> bool {
        self.acquire(max_wait).await.is_ok()
    }

    /// Thread count advised for a new generation at the current load.
    pub async fn recommended_threads(&self, default_threads: usize) -> usize {
        match self.read_cpu().await {
            Ok(cpu) => self.threads_for_cpu(cpu, default_threads),
            Err(e) => {
                debug!(error = %e, "cpu sampling failed, keeping default thread count");
                default_threads
            }
        }
    }

    pub fn threads_for_cpu(&self, cpu: f32, default_threads: usize) -> usize {
        threads_for(cpu, self.config.cores, default_threads)
    }
}

/// Above 70% use half the cores, above 50% two thirds, otherwise the default.
pub fn threads_for(cpu: f32, cores: usize, default_threads: usize) -> usize {
    if cpu > 70.0 {
        (cores / 2).max(1)
    } else if cpu > 50.0 {
        (cores * 2 / 3).max(1)
    } else {
        default_threads
    }
}
