//! Drop (tiered retry) strategy (spec.md §4.C).
//!
//! First tries a non-blocking send. On failure, computes `usage =
//! chan_len/chan_cap` and looks up a wait time + retry count from the
//! capacity/usage matrix. Each retry is a bounded wait; if the timer
//! fires before the channel drains, the record is dropped and counted.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::config::PerformanceConfig;
use crate::value::Record;

use super::{OverflowStrategy, StrategyContext};

struct RetryPlan {
    wait: Duration,
    retries: u32,
}

/// Thresholds are treated as `>=` per capacity bucket, `>` per usage band,
/// matching spec.md §9's explicit resolution of the "what happens at
/// exactly 100,000?" ambiguity.
fn retry_plan(capacity: usize, usage: f64) -> Option<RetryPlan> {
    if capacity >= 100_000 {
        if usage > 0.99 {
            return Some(RetryPlan { wait: Duration::from_micros(1000), retries: 3 });
        }
        if usage > 0.95 {
            return Some(RetryPlan { wait: Duration::from_micros(500), retries: 2 });
        }
        if usage > 0.90 {
            return Some(RetryPlan { wait: Duration::from_micros(100), retries: 1 });
        }
        return None;
    }
    if capacity >= 50_000 {
        if usage > 0.99 {
            return Some(RetryPlan { wait: Duration::from_micros(500), retries: 2 });
        }
        if usage > 0.95 {
            return Some(RetryPlan { wait: Duration::from_micros(200), retries: 1 });
        }
        if usage > 0.90 {
            return Some(RetryPlan { wait: Duration::from_micros(50), retries: 1 });
        }
        return None;
    }
    if usage > 0.99 {
        return Some(RetryPlan { wait: Duration::from_micros(100), retries: 1 });
    }
    if usage > 0.95 {
        return Some(RetryPlan { wait: Duration::from_micros(50), retries: 1 });
    }
    None
}

pub struct DropStrategy {
    ctx: OnceLock<StrategyContext>,
}

impl DropStrategy {
    pub fn new() -> Self {
        Self { ctx: OnceLock::new() }
    }
}

impl Default for DropStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OverflowStrategy for DropStrategy {
    async fn init(&mut self, ctx: StrategyContext, _perf: &PerformanceConfig) {
        let _ = self.ctx.set(ctx);
    }

    async fn process_data(&self, record: Record) -> bool {
        let Some(ctx) = self.ctx.get() else {
            return false;
        };

        let mut record = match ctx.ingress.try_send(record) {
            Ok(()) => return true,
            Err(r) => r,
        };

        let capacity = ctx.ingress.capacity();
        let usage = ctx.ingress.usage();

        let plan = match retry_plan(capacity, usage) {
            Some(p) => p,
            None => {
                ctx.stats.inc_dropped();
                return false;
            }
        };

        for _ in 0..plan.retries {
            sleep(plan.wait).await;
            match ctx.ingress.try_send(record) {
                Ok(()) => return true,
                Err(r) => record = r,
            }
        }

        ctx.stats.inc_dropped();
        false
    }

    fn strategy_name(&self) -> &'static str {
        "drop"
    }

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_table() {
        assert!(retry_plan(100_000, 1.0).is_some());
        assert!(retry_plan(100_000, 0.90).is_none());
        assert!(retry_plan(100_000, 0.901).is_some());
        assert!(retry_plan(50_000, 0.999).is_some());
        assert!(retry_plan(50_000, 0.90).is_none());
        assert!(retry_plan(1_000, 0.999).is_some());
        assert!(retry_plan(1_000, 0.95).is_none());
        assert!(retry_plan(1_000, 0.951).is_some());
    }

    #[test]
    fn exactly_100000_uses_the_large_bucket() {
        let plan = retry_plan(100_000, 0.999).unwrap();
        assert_eq!(plan.wait, Duration::from_micros(1000));
        assert_eq!(plan.retries, 3);
    }
}
