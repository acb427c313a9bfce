//! Stats collector (spec.md §4.A).
//!
//! Thread-safe counters plus a derived `PerformanceLevel` classification.
//! The ordered-threshold evaluation mirrors `redis::health::evaluator`'s
//! `HealthEvaluator::evaluate` — first matching rule wins, top to bottom.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PerformanceLevel {
    Critical,
    Warning,
    HighLoad,
    ModerateLoad,
    Optimal,
}

impl PerformanceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceLevel::Critical => "CRITICAL",
            PerformanceLevel::Warning => "WARNING",
            PerformanceLevel::HighLoad => "HIGH_LOAD",
            PerformanceLevel::ModerateLoad => "MODERATE_LOAD",
            PerformanceLevel::Optimal => "OPTIMAL",
        }
    }

    /// Pure function of `(data_usage_pct, drop_rate_pct)`, per spec.md
    /// §4.A's table. Evaluated strictly top-to-bottom; first match wins.
    pub fn classify(data_usage_pct: f64, drop_rate_pct: f64) -> PerformanceLevel {
        if drop_rate_pct > 50.0 {
            return PerformanceLevel::Critical;
        }
        if drop_rate_pct > 20.0 {
            return PerformanceLevel::Warning;
        }
        if data_usage_pct > 90.0 {
            return PerformanceLevel::HighLoad;
        }
        if data_usage_pct > 70.0 {
            return PerformanceLevel::ModerateLoad;
        }
        PerformanceLevel::Optimal
    }
}

/// Snapshot of the three monotone counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub input_count: u64,
    pub output_count: u64,
    pub dropped_count: u64,
}

impl StatsSnapshot {
    /// `process_rate` / `drop_rate` as percentages. When `input_count == 0`
    /// process_rate is defined as 100% and drop_rate as 0% (spec.md §4.A).
    pub fn process_rate(&self) -> f64 {
        if self.input_count == 0 {
            return 100.0;
        }
        (self.output_count as f64) * 100.0 / (self.input_count as f64)
    }

    pub fn drop_rate(&self) -> f64 {
        if self.input_count == 0 {
            return 0.0;
        }
        (self.dropped_count as f64) * 100.0 / (self.input_count as f64)
    }
}

/// Atomic input/output/dropped counters shared across the pipeline.
#[derive(Debug, Default)]
pub struct StatsCollector {
    input_count: AtomicU64,
    output_count: AtomicU64,
    dropped_count: AtomicU64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_input(&self) {
        self.input_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_output(&self) {
        self.output_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dropped(&self) {
        self.dropped_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dropped_by(&self, n: u64) {
        self.dropped_count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            input_count: self.input_count.load(Ordering::Relaxed),
            output_count: self.output_count.load(Ordering::Relaxed),
            dropped_count: self.dropped_count.load(Ordering::Relaxed),
        }
    }

    /// Resets the three core counters atomically (wrt each other's
    /// ordering guarantees; an observer mid-read may still see a torn
    /// snapshot, matching the source's best-effort reset semantics).
    pub fn reset(&self) {
        self.input_count.store(0, Ordering::Relaxed);
        self.output_count.store(0, Ordering::Relaxed);
        self.dropped_count.store(0, Ordering::Relaxed);
    }

    pub fn performance_level(&self, data_usage_pct: f64) -> PerformanceLevel {
        let snap = self.snapshot();
        PerformanceLevel::classify(data_usage_pct, snap.drop_rate())
    }
}
