//! Deadline-bounded execution of generation operations.
//!
//! Each request id moves RUNNING -> {COMPLETED, TIMED_OUT, FAILED} exactly
//! once. The active map and the history share one lock, and the move from
//! one to the other happens under it. The lock is never held across the
//! awaited operation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{AdmissionError, RunError};
use crate::metrics::{ACTIVE_GENERATIONS, GENERATION_LATENCY, GENERATION_OUTCOMES};

/// Terminal outcome of one generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRecord {
    pub success: bool,
    pub duration: Duration,
    pub timed_out: bool,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
    #[serde(skip)]
    finished: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutorStats {
    pub active: usize,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub timeouts: usize,
    pub average_duration_secs: f64,
}

#[derive(Default)]
struct Ledger {
    active: HashMap<String, Instant>,
    history: HashMap<String, GenerationRecord>,
    next_seq: u64,
}

pub struct TimeoutExecutor {
    config: ExecutorConfig,
    ledger: Mutex<Ledger>,
}

impl TimeoutExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        info!(
            default_timeout_secs = config.default_timeout.as_secs(),
            "timeout executor initialized"
        );
        Self {
            config,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout
    }

    /// Run `operation` under a deadline of `timeout` (or the configured
    /// default). On expiry the operation future is dropped and the caller
    /// gets [`AdmissionError::DeadlineExceeded`]; work the operation handed
    /// off elsewhere is not stopped. If the returned future is itself
    /// dropped, the run is recorded as cancelled.
    pub async fn run<F, Fut, T, E>(
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
        let limit = timeout.unwrap_or(self.config.default_timeout);
        let run = self.begin(request_id);
        debug!(
            request_id = %run.key,
            timeout_secs = limit.as_secs_f64(),
            "generation started"
        );

        let outcome = tokio::time::timeout(limit, operation()).await;
        let elapsed = run.started.elapsed();

        let result = match outcome {
            Ok(Ok(value)) => {
                info!(
                    request_id = %run.key,
                    duration_secs = elapsed.as_secs_f64(),
                    "generation completed"
                );
                run.finish(elapsed, Outcome::Completed);
                Ok(value)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                warn!(request_id = %run.key, error = %message, "generation failed");
                run.finish(elapsed, Outcome::Failed(message));
                Err(RunError::Operation(e))
            }
            Err(_) => {
                warn!(
                    request_id = %run.key,
                    timeout_secs = limit.as_secs(),
                    elapsed_secs = elapsed.as_secs_f64(),
                    "generation exceeded its deadline"
                );
                run.finish(elapsed, Outcome::TimedOut);
                Err(RunError::Deadline(AdmissionError::DeadlineExceeded {
                    timeout: limit,
                    elapsed,
                }))
            }
        };

        self.prune_history();
        result
    }

    /// Enter RUNNING. An id that is in flight or still in the history gets
    /// a `#<seq>` suffix so every run keeps its own entry.
    fn begin(&self, request_id: &str) -> RunGuard<'_> {
        let started = Instant::now();
        let mut ledger = self.ledger.lock();
        ledger.next_seq += 1;

        let key = if ledger.active.contains_key(request_id)
            || ledger.history.contains_key(request_id)
        {
            let key = format!("{request_id}#{}", ledger.next_seq);
            warn!(request_id, tracked_as = %key, "request id reused, tracking under a new key");
            key
        } else {
            request_id.to_string()
        };

        ledger.active.insert(key.clone(), started);
        ACTIVE_GENERATIONS.set(ledger.active.len() as f64);

        RunGuard {
            executor: self,
            key,
            started,
            finished: false,
        }
    }

    fn finish(&self, key: &str, duration: Duration, outcome: Outcome) {
        GENERATION_OUTCOMES
            .with_label_values(&[outcome.label()])
            .inc();
        GENERATION_LATENCY.observe(duration.as_secs_f64());

        let (success, timed_out, error) = match outcome {
            Outcome::Completed => (true, false, None),
            Outcome::TimedOut => (false, true, None),
            Outcome::Failed(message) => (false, false, Some(message)),
            Outcome::Cancelled => (false, false, Some("cancelled".to_string())),
        };
        let record = GenerationRecord {
            success,
            duration,
            timed_out,
            error,
            completed_at: Utc::now(),
            finished: Instant::now(),
        };

        let mut ledger = self.ledger.lock();
        ledger.active.remove(key);
        ledger.history.insert(key.to_string(), record);
        ACTIVE_GENERATIONS.set(ledger.active.len() as f64);
    }

    /// Elapsed seconds per in-flight request, copied under the lock.
    pub fn active_requests(&self) -> HashMap<String, f64> {
        let snapshot: Vec<(String, Instant)> = {
            let ledger = self.ledger.lock();
            ledger
                .active
                .iter()
                .map(|(id, started)| (id.clone(), *started))
                .collect()
        };
        snapshot
            .into_iter()
            .map(|(id, started)| (id, started.elapsed().as_secs_f64()))
            .collect()
    }

    pub fn record(&self, request_id: &str) -> Option<GenerationRecord> {
        self.ledger.lock().history.get(request_id).cloned()
    }

    pub fn stats(&self) -> ExecutorStats {
        let ledger = self.ledger.lock();
        let mut stats = ExecutorStats {
            active: ledger.active.len(),
            total: ledger.history.len(),
            ..ExecutorStats::default()
        };

        let mut success_time = Duration::ZERO;
        for record in ledger.history.values() {
            if record.success {
                stats.successful += 1;
                success_time += record.duration;
            } else {
                stats.failed += 1;
            }
            if record.timed_out {
                stats.timeouts += 1;
            }
        }
        if stats.successful > 0 {
            stats.average_duration_secs = success_time.as_secs_f64() / stats.successful as f64;
        }
        stats
    }

    /// Forget outcomes older than the retention period.
    pub fn prune_history(&self) -> usize {
        let retention = self.config.history_retention;
        let mut ledger = self.ledger.lock();
        let before = ledger.history.len();
        ledger
            .history
            .retain(|_, record| record.finished.elapsed() < retention);
        before - ledger.history.len()
    }
}

/// One RUNNING entry. Records `cancelled` if dropped before `finish`, which
/// happens when the caller stops polling `run` (client went away).
struct RunGuard<'a> {
    executor: &'a TimeoutExecutor,
    key: String,
    started: Instant,
    finished: bool,
}

impl RunGuard<'_> {
    fn finish(mut self, duration: Duration, outcome: Outcome) {
        self.finished = true;
        self.executor.finish(&self.key, duration, outcome);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let elapsed = self.started.elapsed();
        warn!(
            request_id = %self.key,
            elapsed_secs = elapsed.as_secs_f64(),
            "generation abandoned by caller"
        );
        self.executor.finish(&self.key, elapsed, Outcome::Cancelled);
    }
}

enum Outcome {
    Completed,
    TimedOut,
    Failed(String),
    Cancelled,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::sleep;

    fn executor(retention: Duration) -> TimeoutExecutor {
        TimeoutExecutor::new(ExecutorConfig {
            default_timeout: Duration::from_secs(1),
            history_retention: retention,
        })
    }

    #[tokio::test]
    async fn completes_within_budget() {
        let executor = executor(Duration::from_secs(3600));
        let value = executor
            .run(
                "req-1",
                || async {
                    sleep(Duration::from_millis(100)).await;
                    Ok::<_, std::io::Error>("answer")
                },
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(value, "answer");

        let record = executor.record("req-1").unwrap();
        assert!(record.success);
        assert!(!record.timed_out);
        assert!(record.duration >= Duration::from_millis(100));
        assert!(executor.active_requests().is_empty());
    }

    #[tokio::test]
    async fn never_finishing_operation_times_out() {
        let executor = executor(Duration::from_secs(3600));
        let err = executor
            .run(
                "req-2",
                || std::future::pending::<Result<(), std::io::Error>>(),
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();

        match err {
            RunError::Deadline(AdmissionError::DeadlineExceeded { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_millis(200));
            }
            other => panic!("expected deadline, got {other:?}"),
        }

        let record = executor.record("req-2").unwrap();
        assert!(record.timed_out);
        assert!(!record.success);
        assert!(record.duration >= Duration::from_millis(200));
        assert!(record.duration < Duration::from_millis(400));
        assert_eq!(executor.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn operation_errors_pass_through() {
        let executor = executor(Duration::from_secs(3600));
        let err = executor
            .run(
                "req-3",
                || async { Err::<(), _>(std::io::Error::other("backend exploded")) },
                None,
            )
            .await
            .unwrap_err();

        match err {
            RunError::Operation(e) => assert_eq!(e.to_string(), "backend exploded"),
            other => panic!("expected operation error, got {other:?}"),
        }
        let record = executor.record("req-3").unwrap();
        assert_eq!(record.error.as_deref(), Some("backend exploded"));
        assert!(!record.timed_out);
    }

    #[tokio::test]
    async fn tracks_in_flight_requests() {
        let executor = Arc::new(executor(Duration::from_secs(3600)));
        let runner = Arc::clone(&executor);
        let handle = tokio::spawn(async move {
            runner
                .run(
                    "slow",
                    || async {
                        sleep(Duration::from_millis(200)).await;
                        Ok::<_, std::io::Error>(())
                    },
                    None,
                )
                .await
        });

        sleep(Duration::from_millis(50)).await;
        let active = executor.active_requests();
        assert!(active.get("slow").is_some_and(|secs| *secs > 0.0));
        assert_eq!(executor.stats().active, 1);

        handle.await.unwrap().unwrap();
        assert!(executor.active_requests().is_empty());
    }

    #[tokio::test]
    async fn stats_aggregate_history() {
        let executor = executor(Duration::from_secs(3600));
        assert_eq!(executor.stats().average_duration_secs, 0.0);

        for id in ["a", "b"] {
            executor
                .run(id, || async { Ok::<_, std::io::Error>(()) }, None)
                .await
                .unwrap();
        }
        let _ = executor
            .run("c", || async { Err::<(), _>(std::io::Error::other("no")) }, None)
            .await;
        let _ = executor
            .run(
                "d",
                || std::future::pending::<Result<(), std::io::Error>>(),
                Some(Duration::from_millis(10)),
            )
            .await;

        let stats = executor.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.timeouts, 1);
        assert!(stats.average_duration_secs >= 0.0);
    }

    #[tokio::test]
    async fn dropped_run_is_recorded_as_cancelled() {
        let executor = Arc::new(executor(Duration::from_secs(3600)));
        let runner = Arc::clone(&executor);
        let handle = tokio::spawn(async move {
            runner
                .run(
                    "gone",
                    || std::future::pending::<Result<(), std::io::Error>>(),
                    Some(Duration::from_secs(30)),
                )
                .await
        });

        sleep(Duration::from_millis(50)).await;
        assert!(executor.active_requests().contains_key("gone"));

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        assert!(executor.active_requests().is_empty());
        let record = executor.record("gone").unwrap();
        assert!(!record.success);
        assert!(!record.timed_out);
        assert_eq!(record.error.as_deref(), Some("cancelled"));

        let stats = executor.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn overlapping_runs_with_same_id_are_tracked_separately() {
        let executor = Arc::new(executor(Duration::from_secs(3600)));

        let short = {
            let runner = Arc::clone(&executor);
            tokio::spawn(async move {
                runner
                    .run(
                        "dup",
                        || async {
                            sleep(Duration::from_millis(50)).await;
                            Ok::<_, std::io::Error>(())
                        },
                        None,
                    )
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;
        let long = {
            let runner = Arc::clone(&executor);
            tokio::spawn(async move {
                runner
                    .run(
                        "dup",
                        || async {
                            sleep(Duration::from_millis(300)).await;
                            Ok::<_, std::io::Error>(())
                        },
                        None,
                    )
                    .await
            })
        };

        short.await.unwrap().unwrap();
        // the longer run is still in flight under its own key
        let active = executor.active_requests();
        assert_eq!(active.len(), 1);
        assert!(active.keys().all(|k| k.starts_with("dup#")));
        assert_eq!(executor.stats().active, 1);

        long.await.unwrap().unwrap();
        let stats = executor.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.successful, 2);
        assert!(executor.record("dup").is_some());
    }

    #[tokio::test]
    async fn reused_id_after_completion_keeps_both_records() {
        let executor = executor(Duration::from_secs(3600));
        for _ in 0..2 {
            executor
                .run("again", || async { Ok::<_, std::io::Error>(()) }, None)
                .await
                .unwrap();
        }
        assert_eq!(executor.stats().total, 2);
    }

    #[tokio::test]
    async fn old_history_is_pruned_on_next_run() {
        let executor = executor(Duration::from_millis(100));
        executor
            .run("old", || async { Ok::<_, std::io::Error>(()) }, None)
            .await
            .unwrap();
        assert_eq!(executor.stats().total, 1);

        sleep(Duration::from_millis(150)).await;
        executor
            .run("new", || async { Ok::<_, std::io::Error>(()) }, None)
            .await
            .unwrap();

        assert!(executor.record("old").is_none());
        assert!(executor.record("new").is_some());
        assert_eq!(executor.stats().total, 1);
    }
}
