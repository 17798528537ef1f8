// file: src/benchmark.rs
// description: Timing and throughput helpers for weight finalization and forward dispatch.
// author: cipher-rc5

use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone)]
pub struct BenchmarkResult {
    pub operation: String,
    pub duration: Duration,
    pub throughput: Option<f64>,
}

pub struct Benchmark {
    start: Instant,
    operation: String,
}

impl Benchmark {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation: operation.into(),
        }
    }

    pub fn finish(self) -> BenchmarkResult {
        let duration = self.start.elapsed();
        info!("{} took {:?}", self.operation, duration);

        BenchmarkResult {
            operation: self.operation,
            duration,
            throughput: None,
        }
    }

    /// Finish and report activation rows processed per second.
    pub fn finish_with_rows(self, rows: usize) -> BenchmarkResult {
        let duration = self.start.elapsed();
        let rows_per_sec = rows as f64 / duration.as_secs_f64().max(f64::EPSILON);

        info!(
            "{} took {:?} ({:.2} rows/sec)",
            self.operation, duration, rows_per_sec
        );

        BenchmarkResult {
            operation: self.operation,
            duration,
            throughput: Some(rows_per_sec),
        }
    }
}

/// Aggregate of repeated forward calls on one layer.
pub struct DispatchMetrics {
    pub iterations: usize,
    pub rows: usize,
    pub total_time: Duration,
    pub rows_per_second: f64,
    pub ms_per_call: f64,
}

impl DispatchMetrics {
    pub fn new(iterations: usize, rows: usize, total_time: Duration) -> Self {
        let secs = total_time.as_secs_f64().max(f64::EPSILON);
        Self {
            iterations,
            rows,
            total_time,
            rows_per_second: (iterations * rows) as f64 / secs,
            ms_per_call: secs * 1000.0 / iterations.max(1) as f64,
        }
    }

    pub fn print(&self) {
        info!("Dispatch Metrics:");
        info!("  Calls: {} x {} rows", self.iterations, self.rows);
        info!("  Total time: {:?}", self.total_time);
        info!("  Throughput: {:.2} rows/sec", self.rows_per_second);
        info!("  Latency: {:.3} ms/call", self.ms_per_call);
    }
}
