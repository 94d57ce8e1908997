//! Call outcome metrics and periodic reporting

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tonic::Code;
use tracing::{debug, info, warn};

/// Default reporting interval
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Failure rate (percent) above which the collector warns
const FAILURE_WARN_PERCENT: f64 = 10.0;

/// Counters for proxied calls, grouped by final status
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    started: AtomicU64,
    succeeded: AtomicU64,
    unimplemented: AtomicU64,
    not_found: AtomicU64,
    invalid_argument: AtomicU64,
    cancelled: AtomicU64,
    deadline_exceeded: AtomicU64,
    failed: AtomicU64,
}

impl ProxyMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a call accepted by the front end
    pub fn call_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a call that ended with `code`
    pub fn call_finished(&self, code: Code) {
        let counter = match code {
            Code::Ok => &self.succeeded,
            Code::Unimplemented => &self.unimplemented,
            Code::NotFound => &self.not_found,
            Code::InvalidArgument => &self.invalid_argument,
            Code::Cancelled => &self.cancelled,
            Code::DeadlineExceeded => &self.deadline_exceeded,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a call as started and return its record.
    ///
    /// The record counts the call as finished exactly once: with the code
    /// passed to [`CallRecord::finish`], or as cancelled when it is dropped
    /// first.
    pub fn track(self: &Arc<Self>) -> CallRecord {
        self.call_started();
        CallRecord {
            metrics: self.clone(),
            finished: false,
        }
    }

    /// Current counter values
    pub fn snapshot(&self) -> ProxyMetricsSnapshot {
        ProxyMetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            unimplemented: self.unimplemented.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            invalid_argument: self.invalid_argument.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            deadline_exceeded: self.deadline_exceeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Start logging the counters every `period`
    pub fn start_collection_task(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = interval(period);

            info!("Starting proxy metrics collection task (interval: {:?})", period);

            loop {
                interval_timer.tick().await;

                let snapshot = self.snapshot();
                log_metrics(&snapshot);
                check_health(&snapshot);
            }
        })
    }
}

/// A started call that has not been counted as finished yet
#[derive(Debug)]
pub struct CallRecord {
    metrics: Arc<ProxyMetrics>,
    finished: bool,
}

impl CallRecord {
    /// Count the call as finished with `code`; later calls are ignored
    pub fn finish(&mut self, code: Code) {
        if !self.finished {
            self.finished = true;
            self.metrics.call_finished(code);
        }
    }
}

impl Drop for CallRecord {
    fn drop(&mut self) {
        self.finish(Code::Cancelled);
    }
}

/// Point-in-time copy of [`ProxyMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProxyMetricsSnapshot {
    /// Calls accepted
    pub started: u64,
    /// Calls that ended OK
    pub succeeded: u64,
    /// Calls for unregistered methods
    pub unimplemented: u64,
    /// Calls whose key had no registered connection
    pub not_found: u64,
    /// Calls whose first message carried no usable key
    pub invalid_argument: u64,
    /// Calls cancelled by either side
    pub cancelled: u64,
    /// Calls that ran past their deadline
    pub deadline_exceeded: u64,
    /// Calls that ended with any other status
    pub failed: u64,
}

impl ProxyMetricsSnapshot {
    /// Calls that have ended, whatever their status
    pub fn finished(&self) -> u64 {
        self.succeeded
            + self.unimplemented
            + self.not_found
            + self.invalid_argument
            + self.cancelled
            + self.deadline_exceeded
            + self.failed
    }

    /// Calls still running
    pub fn in_flight(&self) -> u64 {
        self.started.saturating_sub(self.finished())
    }

    /// Percentage of ended calls that did not end OK
    pub fn failure_rate(&self) -> f64 {
        let finished = self.finished();
        if finished == 0 {
            return 0.0;
        }
        ((finished - self.succeeded) as f64 / finished as f64) * 100.0
    }
}

fn log_metrics(snapshot: &ProxyMetricsSnapshot) {
    info!(
        "Proxy Metrics - Started: {}, In flight: {}, OK: {}, Unimplemented: {}, Not found: {}, Invalid: {}, Cancelled: {}, Deadline: {}, Failed: {}",
        snapshot.started,
        snapshot.in_flight(),
        snapshot.succeeded,
        snapshot.unimplemented,
        snapshot.not_found,
        snapshot.invalid_argument,
        snapshot.cancelled,
        snapshot.deadline_exceeded,
        snapshot.failed
    );

    if let Ok(json) = serde_json::to_string(snapshot) {
        debug!("Proxy metrics snapshot: {}", json);
    }
}

fn check_health(snapshot: &ProxyMetricsSnapshot) {
    let rate = snapshot.failure_rate();
    if rate > FAILURE_WARN_PERCENT {
        warn!(
            "High proxy failure rate: {:.1}% ({}/{})",
            rate,
            snapshot.finished() - snapshot.succeeded,
            snapshot.finished()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_outcomes_are_grouped() {
        let metrics = ProxyMetrics::new();
        for _ in 0..5 {
            metrics.call_started();
        }
        metrics.call_finished(Code::Ok);
        metrics.call_finished(Code::Ok);
        metrics.call_finished(Code::NotFound);
        metrics.call_finished(Code::PermissionDenied);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.started, 5);
        assert_eq!(snapshot.succeeded, 2);
        assert_eq!(snapshot.not_found, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.finished(), 4);
        assert_eq!(snapshot.in_flight(), 1);
        assert!((snapshot.failure_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = ProxyMetrics::new().snapshot();
        assert_eq!(snapshot, ProxyMetricsSnapshot::default());
        assert_eq!(snapshot.failure_rate(), 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ProxyMetrics::new();
        metrics.call_started();
        metrics.call_finished(Code::DeadlineExceeded);

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["started"], 1);
        assert_eq!(json["deadline_exceeded"], 1);
    }

    #[test]
    fn test_call_record_counts_once() {
        let metrics = Arc::new(ProxyMetrics::new());

        let mut record = metrics.track();
        record.finish(Code::NotFound);
        record.finish(Code::Ok);
        drop(record);

        // Dropped without a final status
        drop(metrics.track());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.started, 2);
        assert_eq!(snapshot.not_found, 1);
        assert_eq!(snapshot.succeeded, 0);
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collection_task_runs() {
        let metrics = Arc::new(ProxyMetrics::new());
        let handle = metrics.clone().start_collection_task(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
