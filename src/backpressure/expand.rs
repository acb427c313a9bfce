//! Expand strategy (spec.md §4.C).
//!
//! Tries a non-blocking send; on failure invokes the channel-expansion
//! routine (spec.md §4.D) and retries; on a second failure falls back to
//! a blocking send so the record is never dropped outright.

use std::sync::OnceLock;

use async_trait::async_trait;

use crate::config::PerformanceConfig;
use crate::ingress::ExpandOutcome;
use crate::value::Record;

use super::{OverflowStrategy, StrategyContext};

pub struct ExpandStrategy {
    ctx: OnceLock<StrategyContext>,
}

impl ExpandStrategy {
    pub fn new() -> Self {
        Self { ctx: OnceLock::new() }
    }
}

impl Default for ExpandStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OverflowStrategy for ExpandStrategy {
    async fn init(&mut self, ctx: StrategyContext, _perf: &PerformanceConfig) {
        let _ = self.ctx.set(ctx);
    }

    async fn process_data(&self, record: Record) -> bool {
        let Some(ctx) = self.ctx.get() else {
            return false;
        };

        let record = match ctx.ingress.try_send(record) {
            Ok(()) => return true,
            Err(r) => r,
        };

        if let ExpandOutcome::Expanded { lost, .. } = ctx.ingress.try_expand().await {
            if lost > 0 {
                ctx.stats.inc_dropped_by(lost);
            }
        }

        let record = match ctx.ingress.try_send(record) {
            Ok(()) => return true,
            Err(r) => r,
        };

        let pair = ctx.ingress.current();
        pair.sender.send(record).await.is_ok()
    }

    fn strategy_name(&self) -> &'static str {
        "expand"
    }

    async fn stop(&self) {}
}
