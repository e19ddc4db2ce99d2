//! Admission control for expensive AI-generation requests.
//!
//! Every generation passes three gates: a per-client [`RateLimiter`], a CPU
//! [`LoadGate`] and a deadline-enforcing [`TimeoutExecutor`]. The
//! [`AdmissionPipeline`] chains them.

pub mod client;
pub mod config;
pub mod error;
pub mod load_gate;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod timeout;

pub use client::{ClientKey, RequestMeta};
pub use config::{
    CategoryRule, ExecutorConfig, GatewayConfig, LoadGateConfig, RateLimitConfig, RouteRule,
};
pub use error::{AdmissionError, ConfigError, LoadError, RunError};
pub use load_gate::{CpuProbe, LoadGate, LoadStatus, ProcStatProbe};
pub use pipeline::{Admission, AdmissionPipeline};
pub use rate_limit::{RateLimitHeaders, RateLimiter};
pub use timeout::{ExecutorStats, GenerationRecord, TimeoutExecutor};
