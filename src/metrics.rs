//! Request counters and timings, injected into the pipeline and front end.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Upper bound of the first histogram bucket, in milliseconds.
pub const BUCKET_START_MS: u64 = 1000;
/// Width of every following bucket, in milliseconds.
pub const BUCKET_WIDTH_MS: u64 = 2500;
pub const BUCKET_COUNT: usize = 40;

pub trait ResizeMetrics: Send + Sync {
    fn request_received(&self);
    fn request_failed(&self);
    /// A request was handed to the pool.
    fn queue_enter(&self);
    /// Its reply arrived, so it is neither waiting nor running anymore.
    fn queue_leave(&self);
    /// Time spent in the pipeline itself.
    fn observe_resize(&self, elapsed: Duration);
    /// Time from admission request to reply, queue wait included.
    fn observe_total(&self, elapsed: Duration);
}

#[derive(Debug, Default)]
pub struct NoopMetrics;

impl ResizeMetrics for NoopMetrics {
    fn request_received(&self) {}
    fn request_failed(&self) {}
    fn queue_enter(&self) {}
    fn queue_leave(&self) {}
    fn observe_resize(&self, _elapsed: Duration) {}
    fn observe_total(&self, _elapsed: Duration) {}
}

/// Millisecond histogram over linear buckets, `le` style: each observation
/// lands in the first bucket whose upper bound it does not exceed, or in the
/// overflow slot past the last bucket.
#[derive(Debug)]
pub struct DurationHistogram {
    buckets: [AtomicU64; BUCKET_COUNT + 1],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketSnapshot {
    /// Upper bound in milliseconds.
    pub le: u64,
    /// Observations at or below `le`.
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<BucketSnapshot>,
    pub count: u64,
    pub sum_ms: u64,
}

pub fn bucket_upper_bound(index: usize) -> u64 {
    BUCKET_START_MS + BUCKET_WIDTH_MS * index as u64
}

impl DurationHistogram {
    pub fn observe(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let index = if ms <= BUCKET_START_MS {
            0
        } else {
            let past = (ms - BUCKET_START_MS).div_ceil(BUCKET_WIDTH_MS);
            usize::try_from(past).map_or(BUCKET_COUNT, |i| i.min(BUCKET_COUNT))
        };
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Cumulative counts per bucket. The overflow slot only shows in `count`.
    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = 0;
        let buckets = (0..BUCKET_COUNT)
            .map(|index| {
                cumulative += self.buckets[index].load(Ordering::Relaxed);
                BucketSnapshot {
                    le: bucket_upper_bound(index),
                    count: cumulative,
                }
            })
            .collect();
        HistogramSnapshot {
            buckets,
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

/// In-memory counters served at `/metrics`.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    requests: AtomicU64,
    failures: AtomicU64,
    queue_length: AtomicI64,
    resizes: AtomicU64,
    resize_micros_total: AtomicU64,
    resize_micros_last: AtomicU64,
    total_micros_total: AtomicU64,
    total_micros_last: AtomicU64,
    resize_histogram: DurationHistogram,
    total_histogram: DurationHistogram,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub resize_requests_total: u64,
    pub resize_failures_total: u64,
    /// Requests handed to the pool whose reply has not arrived yet, both
    /// waiting for a worker and running.
    pub queue_length: i64,
    pub resize_count: u64,
    pub resize_duration_ms_last: u64,
    pub resize_duration_ms_total: u64,
    pub resize_duration_with_queue_wait_ms_last: u64,
    pub resize_duration_with_queue_wait_ms_total: u64,
    pub resize_duration_milliseconds: HistogramSnapshot,
    pub resize_duration_with_queue_wait_milliseconds: HistogramSnapshot,
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

impl CounterMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            resize_requests_total: self.requests.load(Ordering::Relaxed),
            resize_failures_total: self.failures.load(Ordering::Relaxed),
            queue_length: self.queue_length.load(Ordering::Relaxed),
            resize_count: self.resizes.load(Ordering::Relaxed),
            resize_duration_ms_last: self.resize_micros_last.load(Ordering::Relaxed) / 1000,
            resize_duration_ms_total: self.resize_micros_total.load(Ordering::Relaxed) / 1000,
            resize_duration_with_queue_wait_ms_last: self.total_micros_last.load(Ordering::Relaxed)
                / 1000,
            resize_duration_with_queue_wait_ms_total: self
                .total_micros_total
                .load(Ordering::Relaxed)
                / 1000,
            resize_duration_milliseconds: self.resize_histogram.snapshot(),
            resize_duration_with_queue_wait_milliseconds: self.total_histogram.snapshot(),
        }
    }
}

impl ResizeMetrics for CounterMetrics {
    fn request_received(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    fn request_failed(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn queue_enter(&self) {
        self.queue_length.fetch_add(1, Ordering::Relaxed);
    }

    fn queue_leave(&self) {
        self.queue_length.fetch_sub(1, Ordering::Relaxed);
    }

    fn observe_resize(&self, elapsed: Duration) {
        let us = micros(elapsed);
        self.resizes.fetch_add(1, Ordering::Relaxed);
        self.resize_micros_last.store(us, Ordering::Relaxed);
        self.resize_micros_total.fetch_add(us, Ordering::Relaxed);
        self.resize_histogram.observe(elapsed);
    }

    fn observe_total(&self, elapsed: Duration) {
        let us = micros(elapsed);
        self.total_micros_last.store(us, Ordering::Relaxed);
        self.total_micros_total.fetch_add(us, Ordering::Relaxed);
        self.total_histogram.observe(elapsed);
    }
}
