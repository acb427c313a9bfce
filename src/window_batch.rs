//! Window-batch processor (spec.md §4.G).
//!
//! Drains the window's output channel, feeds each row's `window_start`/
//! `window_end` plus the record into the aggregator, then applies
//! DISTINCT, HAVING, and LIMIT (in that order) before emitting through
//! the result fan-out and resetting the aggregator for the next window.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, warn};

use crate::external::{Aggregator, Batch, ExpressionBridge, Window};
use crate::sinks::ResultFanout;
use crate::stats::StatsCollector;
use crate::value::{canonical_record_json, Record, Value};

pub struct WindowBatchProcessor {
    pub window: Box<dyn Window>,
    pub aggregator: Box<dyn Aggregator>,
    pub bridge: Arc<dyn ExpressionBridge>,
    pub having: Option<String>,
    pub distinct: bool,
    pub limit: Option<usize>,
    pub fanout: Arc<ResultFanout>,
    pub stats: Arc<StatsCollector>,
    pub term: watch::Receiver<bool>,
}

impl WindowBatchProcessor {
    /// Runs until the window's output channel closes or termination is
    /// observed. A panic inside the loop is logged; the task then exits
    /// rather than attempting to resume mid-window (spec.md §4.G).
    pub async fn run(mut self) {
        self.window.start();
        let mut output = self.window.take_output();

        loop {
            tokio::select! {
                biased;
                changed = self.term.changed() => {
                    if changed.is_err() || *self.term.borrow() {
                        break;
                    }
                }
                batch = output.recv() => {
                    match batch {
                        Some(batch) => self.handle_batch(batch).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_batch(&mut self, batch: Batch) {
        for row in &batch {
            self.aggregator
                .put("window_start", Value::Number(row.slot.start_ns as f64));
            self.aggregator
                .put("window_end", Value::Number(row.slot.end_ns as f64));
            if let Err(e) = self.aggregator.add(&row.data) {
                warn!(error = %e, "aggregator rejected a row");
            }
        }

        let mut results = match self.aggregator.get_results() {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "aggregator failed to produce results for a window");
                self.aggregator.reset();
                return;
            }
        };

        if self.distinct {
            results = dedup_preserving_order(results);
        }

        if let Some(having) = self.having.as_deref().filter(|h| !h.is_empty()) {
            results = self.apply_having(having, results);
        }

        if let Some(limit) = self.limit {
            results.truncate(limit);
        }

        self.aggregator.reset();

        if results.is_empty() {
            return;
        }

        for _ in 0..results.len() {
            self.stats.inc_output();
        }
        self.fanout.emit(results).await;
    }

    /// Compiled fresh per batch: the HAVING text is evaluated against
    /// this window's aggregated results only, and a compile failure
    /// degrades to passing the batch through unfiltered (spec.md §7).
    fn apply_having(&self, having: &str, results: Vec<Record>) -> Vec<Record> {
        if having.contains("CASE") {
            match self.bridge.compile_expression(having) {
                Ok(expr) => results
                    .into_iter()
                    .filter(|r| match expr.evaluate_value_with_null(r) {
                        Ok((_, true)) => false,
                        Ok((value, false)) => value.is_having_truthy(),
                        Err(e) => {
                            warn!(error = %e, "HAVING expression evaluation failed for a result row");
                            false
                        }
                    })
                    .collect(),
                Err(e) => {
                    warn!(error = %e, having, "HAVING expression failed to compile, passing batch through unfiltered");
                    results
                }
            }
        } else {
            let preprocessed = self.bridge.preprocess_like_expression(having);
            let preprocessed = self.bridge.preprocess_is_null_expression(&preprocessed);
            match self.bridge.compile_condition(&preprocessed) {
                Ok(condition) => results.into_iter().filter(|r| condition.evaluate(r)).collect(),
                Err(e) => {
                    warn!(error = %e, having, "HAVING condition failed to compile, passing batch through unfiltered");
                    results
                }
            }
        }
    }
}

/// Canonicalizes each result by JSON-serialization and keeps only first
/// occurrences, preserving order (spec.md §4.G step 3, §8 property 8).
fn dedup_preserving_order(results: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::new();
    results
        .into_iter()
        .filter(|r| seen.insert(canonical_record_json(r)))
        .collect()
}
