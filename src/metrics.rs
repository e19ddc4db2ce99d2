use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, IntCounterVec, TextEncoder, register_counter,
    register_gauge, register_histogram, register_int_counter_vec,
};


lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("gateway_requests_total", "Total number of generation requests").unwrap();
    pub static ref REJECTIONS: IntCounterVec = register_int_counter_vec!(
        "gateway_rejections_total",
        "Requests turned away by the admission pipeline",
        &["reason"]
    )
    .unwrap();
    pub static ref GENERATION_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "gateway_generation_outcomes_total",
        "Finished generations by outcome",
        &["outcome"]
    )
    .unwrap();
    pub static ref GENERATION_LATENCY: Histogram = register_histogram!(
        "gateway_generation_latency_seconds",
        "Generation latency in seconds"
    )
    .unwrap();
    pub static ref ACTIVE_GENERATIONS: Gauge =
        register_gauge!("gateway_active_generations", "Generations currently running").unwrap();
    pub static ref CPU_USAGE: Gauge =
        register_gauge!("gateway_cpu_usage_percent", "Last sampled CPU utilisation").unwrap();
}

/// Render every registered metric in the prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
