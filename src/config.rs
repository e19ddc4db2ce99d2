use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_CATEGORY: &str = "default";

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "generation-gateway")]
#[command(about = "Admission-controlled gateway for AI generation backends")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // Backend servers (comma-separated)
    // Example: "localhost:11434,localhost:11435"
    #[arg(short, long, default_value = "localhost:11434")]
    pub backends: String,

    // JSON file with the category table, built-in table when absent
    #[arg(long)]
    pub rate_limits: Option<PathBuf>,

    // How long an address stays blocked after abusing a sensitive category (seconds)
    // Overrides the table file; 3600 when neither sets it
    #[arg(long)]
    pub block_duration: Option<u64>,

    // CPU percentage above which new generations wait
    #[arg(long, default_value_t = 80.0)]
    pub cpu_max: f32,

    // CPU percentage treated as critical
    #[arg(long, default_value_t = 90.0)]
    pub cpu_critical: f32,

    // CPU sampling interval in milliseconds
    #[arg(long, default_value_t = 500)]
    pub sample_interval_ms: u64,

    // Base wait between load polls (seconds)
    #[arg(long, default_value_t = 2)]
    pub base_wait: u64,

    // Give up waiting for CPU headroom after this many seconds
    #[arg(long, default_value_t = 30)]
    pub max_wait: u64,

    // Hard deadline for one generation (seconds)
    #[arg(long, default_value_t = 180)]
    pub generation_timeout: u64,

    // Health check interval
    #[arg(long, default_value_t = 30)]
    pub health_interval: u64,

    // Idle rate-limit state sweep interval
    #[arg(long, default_value_t = 60)]
    pub sweep_interval: u64,
}

/// Quota for one endpoint category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub name: String,
    pub limit: u32,
    pub window_secs: u64,
    /// Exceeding the quota blocks the whole address.
    #[serde(default)]
    pub sensitive: bool,
}

impl CategoryRule {
    pub fn new(name: &str, limit: u32, window_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            limit,
            window_secs,
            sensitive: false,
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Maps an endpoint path (exact or prefix) to a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub path: String,
    #[serde(default)]
    pub prefix: bool,
    pub category: String,
}

impl RouteRule {
    pub fn exact(path: &str, category: &str) -> Self {
        Self {
            path: path.to_string(),
            prefix: false,
            category: category.to_string(),
        }
    }

    pub fn prefix(path: &str, category: &str) -> Self {
        Self {
            path: path.to_string(),
            prefix: true,
            category: category.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub categories: Vec<CategoryRule>,
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    #[serde(default = "default_block_duration", with = "secs")]
    pub block_duration: Duration,
}

fn default_block_duration() -> Duration {
    Duration::from_secs(3600)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            categories: vec![
                CategoryRule::new("login", 5, 300).sensitive(),
                CategoryRule::new("admin", 100, 300).sensitive(),
                CategoryRule::new("chat", 30, 60),
                CategoryRule::new("api", 100, 60),
                CategoryRule::new("upload", 10, 60),
                CategoryRule::new(DEFAULT_CATEGORY, 60, 60),
            ],
            routes: vec![
                RouteRule::exact("/api/auth/login", "login"),
                RouteRule::prefix("/api/admin/", "admin"),
                RouteRule::exact("/api/generate", "chat"),
                RouteRule::exact("/api/chat", "chat"),
                RouteRule::prefix("/api/upload", "upload"),
                RouteRule::prefix("/api/", "api"),
            ],
            block_duration: default_block_duration(),
        }
    }
}

impl RateLimitConfig {
    /// Load a category table from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for rule in &self.categories {
            if rule.limit == 0 || rule.window_secs == 0 {
                return Err(ConfigError::InvalidCategory(rule.name.clone()));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::DuplicateCategory(rule.name.clone()));
            }
        }
        if !names.contains(DEFAULT_CATEGORY) {
            return Err(ConfigError::MissingDefault);
        }
        if let Some(route) = self
            .routes
            .iter()
            .find(|r| !names.contains(r.category.as_str()))
        {
            return Err(ConfigError::UnknownCategory {
                path: route.path.clone(),
                category: route.category.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LoadGateConfig {
    pub cpu_max: f32,
    pub cpu_critical: f32,
    pub sample_interval: Duration,
    pub base_wait: Duration,
    /// Cores the advised thread count is derived from.
    pub cores: usize,
}

impl Default for LoadGateConfig {
    fn default() -> Self {
        Self {
            cpu_max: 80.0,
            cpu_critical: 90.0,
            sample_interval: Duration::from_millis(500),
            base_wait: Duration::from_secs(2),
            cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl LoadGateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_max > self.cpu_critical {
            return Err(ConfigError::Thresholds {
                max: self.cpu_max,
                critical: self.cpu_critical,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub default_timeout: Duration,
    pub history_retention: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(180),
            history_retention: Duration::from_secs(3600),
        }
    }
}

/// Everything the gateway needs, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub rate_limit: RateLimitConfig,
    pub load_gate: LoadGateConfig,
    pub executor: ExecutorConfig,
    pub max_wait: Duration,
}

impl GatewayConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut rate_limit = match &args.rate_limits {
            Some(path) => RateLimitConfig::from_file(path)?,
            None => RateLimitConfig::default(),
        };
        if let Some(secs) = args.block_duration {
            rate_limit.block_duration = Duration::from_secs(secs);
        }

        let load_gate = LoadGateConfig {
            cpu_max: args.cpu_max,
            cpu_critical: args.cpu_critical,
            sample_interval: Duration::from_millis(args.sample_interval_ms),
            base_wait: Duration::from_secs(args.base_wait),
            ..LoadGateConfig::default()
        };
        load_gate.validate()?;

        Ok(Self {
            rate_limit,
            load_gate,
            executor: ExecutorConfig {
                default_timeout: Duration::from_secs(args.generation_timeout),
                ..ExecutorConfig::default()
            },
            max_wait: Duration::from_secs(args.max_wait),
        })
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
