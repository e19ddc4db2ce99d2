use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use generation_gateway::AdmissionPipeline;
use crate::load_balancer::LoadBalancer;
// app's shared state

pub struct AppState {
    pub client: reqwest::Client,
    pub load_balancer: Arc<LoadBalancer>,
    pub pipeline: AdmissionPipeline,
    pub default_threads: usize, // thread count when the machine is quiet
    request_seq: AtomicU64,
}

impl AppState {
    pub fn new(
        client: reqwest::Client,
        load_balancer: Arc<LoadBalancer>,
        pipeline: AdmissionPipeline,
        default_threads: usize,
    ) -> Self {
        Self {
            client,
            load_balancer,
            pipeline,
            default_threads,
            request_seq: AtomicU64::new(0),
        }
    }

    // Generated id for requests that did not bring an X-Request-Id
    pub fn next_request_id(&self) -> String {
        let seq = self.request_seq.fetch_add(1, Ordering::Relaxed);
        format!("gen-{}-{}", Utc::now().timestamp_millis(), seq)
    }
}
