//! Query + performance configuration (spec.md §3).
//!
//! `Config` is produced externally by the SQL compiler in the real system;
//! this crate still defines (and validates) the struct so tests, the demo
//! binary, and callers embedding the engine directly have something to
//! build. Validation follows `appconfig.rs`/`db/config.rs`'s pattern:
//! one `validate()` pass returning the first violated invariant.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{StreamSqlError, StreamSqlResult};

#[derive(Debug, Clone, Deserialize)]
pub struct WindowSpec {
    /// "tumbling" | "sliding" | "counting" | "session" (interpreted by the
    /// external window implementation; the core only passes it through).
    pub window_type: String,
    pub params: BTreeMap<String, String>,
    pub timestamp_field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldExpression {
    pub expression: String,
    pub referenced_fields: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub predicate: Option<String>,
    #[serde(default)]
    pub window: Option<WindowSpec>,
    #[serde(default)]
    pub group_by: Vec<String>,
    /// aggregate output name -> aggregate kind (e.g. "sum", "avg").
    #[serde(default)]
    pub select_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub field_aliases: BTreeMap<String, String>,
    /// Simple-field projection specs (not aggregates): `*`, `name`,
    /// `name:alias`, `func(...)`, `'literal'`.
    #[serde(default)]
    pub simple_fields: Vec<String>,
    #[serde(default)]
    pub field_expressions: BTreeMap<String, FieldExpression>,
    #[serde(default)]
    pub having: Option<String>,
    #[serde(default)]
    pub distinct: bool,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

impl Config {
    /// A query needs window processing iff a window spec and/or group-by
    /// fields and/or aggregate select-fields are present.
    pub fn needs_window(&self) -> bool {
        self.window.is_some() || !self.group_by.is_empty() || !self.select_fields.is_empty()
    }
}

pub const ALLOWED_STRATEGIES: &[&str] = &["drop", "block", "expand", "persist"];

#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_ingress_buffer")]
    pub ingress_buffer_size: usize,
    #[serde(default = "default_result_buffer")]
    pub result_buffer_size: usize,
    #[serde(default = "default_window_output_buffer")]
    pub window_output_buffer_size: usize,

    #[serde(default = "default_strategy")]
    pub overflow_strategy: String,

    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,
    #[serde(default = "default_expand_growth_factor")]
    pub expand_growth_factor: f64,
    #[serde(default = "default_expand_threshold")]
    pub expand_threshold: f64,

    #[serde(default = "default_sink_pool_size")]
    pub sink_pool_size: usize,
    #[serde(default = "default_sink_worker_count")]
    pub sink_worker_count: usize,
    #[serde(default = "default_max_retry_routines")]
    pub max_retry_routines: usize,

    pub persistence: Option<PersistenceConfig>,

    #[serde(default)]
    pub monitoring_enabled: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            ingress_buffer_size: default_ingress_buffer(),
            result_buffer_size: default_result_buffer(),
            window_output_buffer_size: default_window_output_buffer(),
            overflow_strategy: default_strategy(),
            block_timeout_ms: default_block_timeout_ms(),
            expand_growth_factor: default_expand_growth_factor(),
            expand_threshold: default_expand_threshold(),
            sink_pool_size: default_sink_pool_size(),
            sink_worker_count: default_sink_worker_count(),
            max_retry_routines: default_max_retry_routines(),
            persistence: None,
            monitoring_enabled: false,
        }
    }
}

fn default_ingress_buffer() -> usize {
    10_000
}
fn default_result_buffer() -> usize {
    10_000
}
fn default_window_output_buffer() -> usize {
    1_000
}
fn default_strategy() -> String {
    "expand".to_string()
}
fn default_block_timeout_ms() -> u64 {
    30_000
}
fn default_expand_growth_factor() -> f64 {
    1.5
}
fn default_expand_threshold() -> f64 {
    0.9
}
fn default_sink_pool_size() -> usize {
    500
}
fn default_sink_worker_count() -> usize {
    8
}
fn default_max_retry_routines() -> usize {
    5
}

impl PerformanceConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Validates the config per spec.md §4.I: non-negative sizes (enforced
    /// by type, `usize`/`u64`), strategy name in the allowed set or empty,
    /// and `persist` requiring a persistence config.
    pub fn validate(&self) -> StreamSqlResult<()> {
        if self.ingress_buffer_size == 0 {
            return Err(StreamSqlError::Config(
                "ingress_buffer_size must be > 0".into(),
            ));
        }
        if self.result_buffer_size == 0 {
            return Err(StreamSqlError::Config(
                "result_buffer_size must be > 0".into(),
            ));
        }
        if self.sink_worker_count == 0 {
            return Err(StreamSqlError::Config(
                "sink_worker_count must be > 0".into(),
            ));
        }
        if !self.overflow_strategy.is_empty()
            && !ALLOWED_STRATEGIES.contains(&self.overflow_strategy.as_str())
        {
            return Err(StreamSqlError::Config(format!(
                "unknown overflow strategy '{}'; expected one of {:?}",
                self.overflow_strategy, ALLOWED_STRATEGIES
            )));
        }
        if self.overflow_strategy == "persist" && self.persistence.is_none() {
            return Err(StreamSqlError::Config(
                "overflow_strategy 'persist' requires a [performance.persistence] section".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    pub data_dir: String,
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}
fn default_flush_interval_ms() -> u64 {
    5_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_interval_ms() -> u64 {
    2_000
}

impl PersistenceConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_performance_config_is_valid() {
        assert!(PerformanceConfig::default().validate().is_ok());
    }

    #[test]
    fn unknown_strategy_rejected() {
        let mut cfg = PerformanceConfig::default();
        cfg.overflow_strategy = "bogus".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn persist_without_persistence_config_rejected() {
        let mut cfg = PerformanceConfig::default();
        cfg.overflow_strategy = "persist".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn persist_with_persistence_config_ok() {
        let mut cfg = PerformanceConfig::default();
        cfg.overflow_strategy = "persist".into();
        cfg.persistence = Some(PersistenceConfig {
            data_dir: "/tmp/streamsql".into(),
            max_file_size_bytes: default_max_file_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
        });
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_sized_buffers_rejected() {
        let mut cfg = PerformanceConfig::default();
        cfg.ingress_buffer_size = 0;
        assert!(cfg.validate().is_err());
    }
}
