//! Metrics Aggregator (Component F): histograms, counters, and rolling
//! windows, with atomic ring-buffered snapshots.
//!
//! Grounded on `AgentKern-agentkern`'s `cost.rs`, which guards its running
//! accumulator with a `parking_lot::RwLock` and exposes a cheap snapshot
//! read; generalized here to per-name histograms/counters/windows each
//! behind their own lock, keyed in a `DashMap` the way the state machine
//! keys its per-agent entries.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::events::{Event, EventBus};

const DEFAULT_HISTOGRAM_CAPACITY: usize = 10_000;
const SNAPSHOT_RING_CAPACITY: usize = 100;
const COUNTER_RATE_WINDOW_MS: i64 = 60_000;

pub fn duration_bucket(seconds: f64) -> &'static str {
    if seconds < 1.0 {
        "0-1s"
    } else if seconds < 5.0 {
        "1-5s"
    } else if seconds < 30.0 {
        "5-30s"
    } else if seconds < 60.0 {
        "30s-1m"
    } else if seconds < 300.0 {
        "1-5m"
    } else {
        "5m+"
    }
}

pub fn subtask_bucket(count: u32) -> &'static str {
    match count {
        0..=1 => "1",
        2..=3 => "2-3",
        4..=7 => "4-7",
        8..=15 => "8-15",
        _ => "16+",
    }
}

pub fn depth_bucket(depth: u32) -> &'static str {
    match depth {
        0 => "0",
        1 => "1",
        2 => "2",
        3 => "3",
        _ => "4+",
    }
}

/// A circular buffer of samples; percentiles are computed by sorting the
/// current contents on demand rather than maintained incrementally.
pub struct Histogram {
    capacity: usize,
    samples: VecDeque<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Histogram {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, value: f64) {
        self.samples.push_back(value);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let rank = ((p * (sorted.len() - 1) as f64).round()) as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    pub fn summary(&self) -> HistogramSummary {
        if self.samples.is_empty() {
            return HistogramSummary { count: 0, sum: 0.0, min: 0.0, max: 0.0, p50: 0.0, p95: 0.0, p99: 0.0 };
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let sum: f64 = sorted.iter().sum();
        HistogramSummary {
            count: sorted.len(),
            sum,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p50: Self::percentile(&sorted, 0.50),
            p95: Self::percentile(&sorted, 0.95),
            p99: Self::percentile(&sorted, 0.99),
        }
    }
}

/// A monotonically-increasing count plus a per-minute rate derived from a
/// pruned timestamp log (§9: "intentionally approximate; precise rates
/// should be derived from snapshots").
pub struct Counter {
    value: u64,
    events: VecDeque<DateTime<Utc>>,
}

impl Counter {
    fn new() -> Self {
        Self { value: 0, events: VecDeque::new() }
    }

    pub fn increment(&mut self, by: u64) {
        self.value += by;
        let now = Utc::now();
        for _ in 0..by {
            self.events.push_back(now);
        }
        self.prune(now);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::milliseconds(COUNTER_RATE_WINDOW_MS);
        while self.events.front().map(|t| *t < cutoff).unwrap_or(false) {
            self.events.pop_front();
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn rate_per_minute(&mut self) -> f64 {
        self.prune(Utc::now());
        self.events.len() as f64
    }
}

/// A fixed-bucket ring, advanced lazily by elapsed-time division, used for
/// rolling rate/throughput windows distinct from the governor's rate-limit
/// windows.
pub struct RollingWindow {
    buckets: Vec<f64>,
    bucket_span_ms: i64,
    current_index: usize,
    last_advanced: DateTime<Utc>,
}

impl RollingWindow {
    pub fn new(bucket_count: usize, bucket_span_ms: i64) -> Self {
        Self {
            buckets: vec![0.0; bucket_count.max(1)],
            bucket_span_ms: bucket_span_ms.max(1),
            current_index: 0,
            last_advanced: Utc::now(),
        }
    }

    fn advance(&mut self, now: DateTime<Utc>) {
        let elapsed_ms = (now - self.last_advanced).num_milliseconds();
        if elapsed_ms < self.bucket_span_ms {
            return;
        }
        let steps = (elapsed_ms / self.bucket_span_ms).min(self.buckets.len() as i64) as usize;
        for _ in 0..steps {
            self.current_index = (self.current_index + 1) % self.buckets.len();
            self.buckets[self.current_index] = 0.0;
        }
        self.last_advanced = now;
    }

    pub fn record(&mut self, value: f64) {
        self.advance(Utc::now());
        self.buckets[self.current_index] += value;
    }

    pub fn sum(&mut self) -> f64 {
        self.advance(Utc::now());
        self.buckets.iter().sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub at: DateTime<Utc>,
    pub counters: std::collections::HashMap<String, u64>,
    pub histograms: std::collections::HashMap<String, HistogramSummary>,
}

/// Owns every named histogram, counter, and rolling window. A ring of the
/// last [`SNAPSHOT_RING_CAPACITY`] atomic snapshots is retained for
/// retrospective reads.
pub struct MetricsAggregator {
    histograms: DashMap<String, Mutex<Histogram>>,
    counters: DashMap<String, Mutex<Counter>>,
    windows: DashMap<String, Mutex<RollingWindow>>,
    snapshots: Mutex<VecDeque<MetricsSnapshot>>,
    default_histogram_capacity: usize,
    events: EventBus,
}

impl MetricsAggregator {
    pub fn new(events: EventBus) -> Self {
        Self::with_histogram_capacity(DEFAULT_HISTOGRAM_CAPACITY, events)
    }

    pub fn with_histogram_capacity(capacity: usize, events: EventBus) -> Self {
        Self {
            histograms: DashMap::new(),
            counters: DashMap::new(),
            windows: DashMap::new(),
            snapshots: Mutex::new(VecDeque::new()),
            default_histogram_capacity: capacity,
            events,
        }
    }

    pub fn record_histogram(&self, name: &str, value: f64) {
        self.histograms
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(Histogram::new(self.default_histogram_capacity)))
            .lock()
            .record(value);
    }

    pub fn record_duration_seconds(&self, name: &str, seconds: f64) {
        self.record_histogram(name, seconds);
    }

    pub fn histogram_summary(&self, name: &str) -> Option<HistogramSummary> {
        self.histograms.get(name).map(|h| h.lock().summary())
    }

    pub fn increment_counter(&self, name: &str, by: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(Counter::new()))
            .lock()
            .increment(by);
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| c.lock().value()).unwrap_or(0)
    }

    pub fn counter_rate_per_minute(&self, name: &str) -> f64 {
        self.counters
            .get(name)
            .map(|c| c.lock().rate_per_minute())
            .unwrap_or(0.0)
    }

    pub fn record_window(&self, name: &str, bucket_count: usize, bucket_span_ms: i64, value: f64) {
        self.windows
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(RollingWindow::new(bucket_count, bucket_span_ms)))
            .lock()
            .record(value);
    }

    pub fn window_sum(&self, name: &str) -> f64 {
        self.windows.get(name).map(|w| w.lock().sum()).unwrap_or(0.0)
    }

    /// Capture a consistent snapshot of every counter and histogram, push it
    /// onto the retention ring, and emit `metrics:snapshot`.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().lock().value()))
            .collect();
        let histograms = self
            .histograms
            .iter()
            .map(|e| (e.key().clone(), e.value().lock().summary()))
            .collect();

        let snapshot = MetricsSnapshot { at: Utc::now(), counters, histograms };

        let mut ring = self.snapshots.lock();
        ring.push_back(snapshot.clone());
        while ring.len() > SNAPSHOT_RING_CAPACITY {
            ring.pop_front();
        }
        drop(ring);

        self.events.emit(Event::MetricsSnapshot {
            snapshot_id: self.snapshots.lock().len() as u64,
        });
        snapshot
    }

    pub fn recent_snapshots(&self) -> Vec<MetricsSnapshot> {
        self.snapshots.lock().iter().cloned().collect()
    }

    /// Clear every histogram, counter, and window.
    pub fn reset(&self) {
        self.histograms.clear();
        self.counters.clear();
        self.windows.clear();
        self.events.emit(Event::MetricsReset);
    }

    pub fn persist(&self) {
        self.events.emit(Event::MetricsPersist);
    }

    pub fn close(&self) {
        self.events.emit(Event::MetricsClosed);
    }
}
