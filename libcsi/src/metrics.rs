//! Per-RPC operation metrics.
//!
//! Services receive a [`MetricsSink`] at construction and report every RPC
//! outcome through [`observe`]. [`OperationMetrics`] keeps in-memory counters
//! keyed by operation and gRPC code; [`NoopMetrics`] discards everything.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tonic::Code;
use tracing::{debug, info};

use crate::error::CsiError;

/// Receives one sample per finished RPC.
pub trait MetricsSink: Send + Sync {
    fn record(&self, operation: &'static str, code: Code, elapsed: Duration);
}

/// Discards all samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _operation: &'static str, _code: Code, _elapsed: Duration) {}
}

/// Aggregated samples for one (operation, code) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl OpStats {
    pub fn avg(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::ZERO,
        }
    }
}

/// In-memory counters and latency totals.
#[derive(Debug, Default)]
pub struct OperationMetrics {
    ops: DashMap<(&'static str, Code), OpStats>,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stats for one operation and result code.
    pub fn get(&self, operation: &str, code: Code) -> OpStats {
        self.ops
            .iter()
            .find(|e| e.key().0 == operation && e.key().1 == code)
            .map(|e| *e.value())
            .unwrap_or_default()
    }

    /// Every recorded (operation, code) pair, sorted by operation name.
    pub fn snapshot(&self) -> Vec<(&'static str, Code, OpStats)> {
        let mut out: Vec<_> = self
            .ops
            .iter()
            .map(|e| (e.key().0, e.key().1, *e.value()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0).then((a.1 as i32).cmp(&(b.1 as i32))));
        out
    }

    /// Emit the current totals at `info`.
    pub fn log_summary(&self) {
        for (operation, code, stats) in self.snapshot() {
            info!(
                operation,
                code = ?code,
                count = stats.count,
                avg_ms = stats.avg().as_millis() as u64,
                max_ms = stats.max.as_millis() as u64,
                "operation totals"
            );
        }
    }
}

impl MetricsSink for OperationMetrics {
    fn record(&self, operation: &'static str, code: Code, elapsed: Duration) {
        let mut stats = self.ops.entry((operation, code)).or_default();
        stats.count += 1;
        stats.total += elapsed;
        stats.max = stats.max.max(elapsed);
    }
}

/// Run `fut` and report its outcome to `sink` under `operation`.
pub async fn observe<T, Fut>(
    sink: &dyn MetricsSink,
    operation: &'static str,
    fut: Fut,
) -> Result<T, CsiError>
where
    Fut: Future<Output = Result<T, CsiError>>,
{
    let start = Instant::now();
    let result = fut.await;
    let code = match &result {
        Ok(_) => Code::Ok,
        Err(e) => e.code(),
    };
    let elapsed = start.elapsed();
    debug!(operation, ?code, elapsed_ms = elapsed.as_millis() as u64, "rpc finished");
    sink.record(operation, code, elapsed);
    result
}

/// [`observe`], then shape the result for a tonic handler.
pub async fn observe_rpc<T, Fut>(
    sink: &dyn MetricsSink,
    operation: &'static str,
    fut: Fut,
) -> Result<tonic::Response<T>, tonic::Status>
where
    Fut: Future<Output = Result<T, CsiError>>,
{
    observe(sink, operation, fut)
        .await
        .map(tonic::Response::new)
        .map_err(tonic::Status::from)
}
