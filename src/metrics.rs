//! Metrics surface (spec.md §4.J).
//!
//! A snapshot of the atomic counters plus the derived usage/rate fields,
//! grounded on `redis/metrics.rs`'s optional-prometheus pattern: every
//! field still exists with the `metrics` feature off, registration and
//! export just compile away.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::ingress::IngressChannel;
use crate::stats::{PerformanceLevel, StatsCollector};

#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};

/// Atomic reads only — `input_count`/`output_count`/`dropped_count` plus
/// channel occupancy and the active-retry-worker / expanding flags.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub input_count: u64,
    pub output_count: u64,
    pub dropped_count: u64,
    pub data_chan_len: usize,
    pub data_chan_cap: usize,
    pub result_chan_len: usize,
    pub result_chan_cap: usize,
    pub sink_pool_len: usize,
    pub sink_pool_cap: usize,
    pub active_retries: usize,
    pub expanding: bool,
}

/// `MetricsSnapshot` plus computed rates (spec.md §4.J: `inputCount == 0`
/// ⇒ `process_rate = 100`, `drop_rate = 0`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetailedMetrics {
    pub snapshot: MetricsSnapshot,
    pub data_chan_usage: f64,
    pub result_chan_usage: f64,
    pub sink_pool_usage: f64,
    pub process_rate: f64,
    pub drop_rate: f64,
    pub performance_level: PerformanceLevel,
}

/// Source for the fields a `MetricsSurface` can't read off `StatsCollector`
/// alone — result-channel and sink-pool occupancy live in `sinks::ResultFanout`,
/// which this crate intentionally keeps decoupled from metrics collection.
pub trait ChannelOccupancy: Send + Sync {
    fn result_chan_len(&self) -> usize;
    fn result_chan_cap(&self) -> usize;
    fn sink_pool_len(&self) -> usize;
    fn sink_pool_cap(&self) -> usize;
}

pub struct MetricsSurface {
    ingress: Arc<IngressChannel>,
    stats: Arc<StatsCollector>,
    channels: Arc<dyn ChannelOccupancy>,
    active_retries: Arc<AtomicUsize>,

    #[cfg(feature = "metrics")]
    registry: Registry,
    #[cfg(feature = "metrics")]
    input_total: IntGauge,
    #[cfg(feature = "metrics")]
    output_total: IntGauge,
    #[cfg(feature = "metrics")]
    dropped_total: IntGauge,
    #[cfg(feature = "metrics")]
    data_chan_usage: IntGauge,
}

impl MetricsSurface {
    pub fn new(
        ingress: Arc<IngressChannel>,
        stats: Arc<StatsCollector>,
        channels: Arc<dyn ChannelOccupancy>,
        active_retries: Arc<AtomicUsize>,
    ) -> crate::error::StreamSqlResult<Self> {
        #[cfg(feature = "metrics")]
        {
            let registry = Registry::new();
            let input_total = IntGauge::with_opts(Opts::new("streamsql_input_total", "Records accepted by the stream"))?;
            let output_total = IntGauge::with_opts(Opts::new("streamsql_output_total", "Records emitted by the stream"))?;
            let dropped_total = IntGauge::with_opts(Opts::new("streamsql_dropped_total", "Records dropped by the stream"))?;
            let data_chan_usage = IntGauge::with_opts(Opts::new("streamsql_ingress_usage_permille", "Ingress channel usage, in permille"))?;

            registry.register(Box::new(input_total.clone()))?;
            registry.register(Box::new(output_total.clone()))?;
            registry.register(Box::new(dropped_total.clone()))?;
            registry.register(Box::new(data_chan_usage.clone()))?;

            Ok(Self {
                ingress,
                stats,
                channels,
                active_retries,
                registry,
                input_total,
                output_total,
                dropped_total,
                data_chan_usage,
            })
        }

        #[cfg(not(feature = "metrics"))]
        {
            Ok(Self {
                ingress,
                stats,
                channels,
                active_retries,
            })
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let snap = self.stats.snapshot();
        MetricsSnapshot {
            input_count: snap.input_count,
            output_count: snap.output_count,
            dropped_count: snap.dropped_count,
            data_chan_len: self.ingress.len(),
            data_chan_cap: self.ingress.capacity(),
            result_chan_len: self.channels.result_chan_len(),
            result_chan_cap: self.channels.result_chan_cap(),
            sink_pool_len: self.channels.sink_pool_len(),
            sink_pool_cap: self.channels.sink_pool_cap(),
            active_retries: self.active_retries.load(Ordering::Relaxed),
            expanding: self.ingress.is_expanding(),
        }
    }

    pub fn detailed(&self) -> DetailedMetrics {
        let snapshot = self.snapshot();
        let usage = |len: usize, cap: usize| if cap == 0 { 0.0 } else { len as f64 / cap as f64 };

        let data_chan_usage = usage(snapshot.data_chan_len, snapshot.data_chan_cap);
        let result_chan_usage = usage(snapshot.result_chan_len, snapshot.result_chan_cap);
        let sink_pool_usage = usage(snapshot.sink_pool_len, snapshot.sink_pool_cap);

        let full = self.stats.snapshot();
        let process_rate = full.process_rate();
        let drop_rate = full.drop_rate();
        let performance_level = PerformanceLevel::classify(data_chan_usage * 100.0, drop_rate);

        #[cfg(feature = "metrics")]
        {
            self.input_total.set(snapshot.input_count as i64);
            self.output_total.set(snapshot.output_count as i64);
            self.dropped_total.set(snapshot.dropped_count as i64);
            self.data_chan_usage.set((data_chan_usage * 1000.0) as i64);
        }

        DetailedMetrics {
            snapshot,
            data_chan_usage,
            result_chan_usage,
            sink_pool_usage,
            process_rate,
            drop_rate,
            performance_level,
        }
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    #[cfg(feature = "metrics")]
    pub fn encode_text(&self) -> crate::error::StreamSqlResult<String> {
        let _ = self.detailed();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&mf, &mut buf).map_err(crate::error::StreamSqlError::Prometheus)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
