//! Rate limiter -> load gate -> timeout executor, in that order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::client::{ClientKey, RequestMeta};
use crate::error::{AdmissionError, RunError};
use crate::load_gate::LoadGate;
use crate::metrics::REJECTIONS;
use crate::rate_limit::{RateLimitHeaders, RateLimiter};
use crate::timeout::TimeoutExecutor;

/// A request that cleared the rate limiter and the load gate.
#[derive(Debug, Clone)]
pub struct Admission {
    pub key: ClientKey,
    pub headers: RateLimitHeaders,
    /// Thread count the generation should use at the current load.
    pub threads: usize,
}

#[derive(Clone)]
pub struct AdmissionPipeline {
    pub rate_limiter: Arc<RateLimiter>,
    pub load_gate: Arc<LoadGate>,
    pub executor: Arc<TimeoutExecutor>,
    max_wait: Duration,
}

impl AdmissionPipeline {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        load_gate: Arc<LoadGate>,
        executor: Arc<TimeoutExecutor>,
        max_wait: Duration,
    ) -> Self {
        Self {
            rate_limiter,
            load_gate,
            executor,
            max_wait,
        }
    }

    pub fn client_key(&self, meta: &RequestMeta) -> ClientKey {
        let category = self.rate_limiter.resolve_category(&meta.path);
        ClientKey::new(meta.client_address(), category)
    }

    pub async fn admit(
        &self,
        meta: &RequestMeta,
        default_threads: usize,
    ) -> Result<Admission, AdmissionError> {
        let key = self.client_key(meta);

        if let Err(e) = self.rate_limiter.check(&key) {
            return Err(self.rejected(&key, e));
        }

        let status = match self.load_gate.acquire(self.max_wait).await {
            Ok(status) => status,
            Err(e) => return Err(self.rejected(&key, e)),
        };

        let threads = self
            .load_gate
            .threads_for_cpu(status.current_cpu, default_threads);
        debug!(client = %key, cpu = status.current_cpu, threads, "request admitted");

        Ok(Admission {
            headers: self.rate_limiter.headers(&key),
            key,
            threads,
        })
    }

    pub async fn execute<F, Fut, T, E>(
        &self,
        request_id: &str,
        operation: F,
        timeout: Option<Duration>,
    ) -> Result<T, RunError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let result = self.executor.run(request_id, operation, timeout).await;
        if let Err(RunError::Deadline(e)) = &result {
            REJECTIONS.with_label_values(&[e.kind()]).inc();
        }
        result
    }

    fn rejected(&self, key: &ClientKey, err: AdmissionError) -> AdmissionError {
        REJECTIONS.with_label_values(&[err.kind()]).inc();
        warn!(client = %key, reason = err.kind(), detail = %err, "request rejected");
        err
    }
}
