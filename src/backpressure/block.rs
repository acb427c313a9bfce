//! Block strategy (spec.md §4.C).
//!
//! If `blockingTimeout <= 0`, performs an unbounded blocking send. Else
//! attempts a bounded send; on timeout, logs an error but continues to
//! block indefinitely — the contract forbids loss. `Sender::reserve()` is
//! used (rather than `Sender::send()`) under the timeout so a cancelled
//! attempt never drops the record the caller handed us: the record only
//! moves once a permit has actually been reserved.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use tracing::error;

use crate::config::PerformanceConfig;
use crate::value::Record;

use super::{OverflowStrategy, StrategyContext};

pub struct BlockStrategy {
    ctx: OnceLock<StrategyContext>,
    timeout: Duration,
}

impl BlockStrategy {
    pub fn new() -> Self {
        Self {
            ctx: OnceLock::new(),
            timeout: Duration::ZERO,
        }
    }

    async fn blocking_send(&self, ctx: &StrategyContext, record: Record) -> bool {
        let pair = ctx.ingress.current();
        pair.sender.send(record).await.is_ok()
    }
}

impl Default for BlockStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OverflowStrategy for BlockStrategy {
    async fn init(&mut self, ctx: StrategyContext, perf: &PerformanceConfig) {
        self.timeout = perf.block_timeout();
        let _ = self.ctx.set(ctx);
    }

    async fn process_data(&self, record: Record) -> bool {
        let Some(ctx) = self.ctx.get() else {
            return false;
        };

        if self.timeout.is_zero() {
            return self.blocking_send(ctx, record).await;
        }

        let pair = ctx.ingress.current();
        match tokio::time::timeout(self.timeout, pair.sender.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(record);
                true
            }
            Ok(Err(_closed)) => false,
            Err(_elapsed) => {
                error!(timeout_ms = self.timeout.as_millis() as u64, "block strategy timed out, continuing to block indefinitely");
                self.blocking_send(ctx, record).await
            }
        }
    }

    fn strategy_name(&self) -> &'static str {
        "block"
    }

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::IngressChannel;
    use crate::stats::StatsCollector;
    use crate::value::Value;
    use std::sync::Arc;

    fn rec(n: i64) -> Record {
        let mut r = Record::new();
        r.insert("n".to_string(), Value::Number(n as f64));
        r
    }

    #[tokio::test]
    async fn unbounded_send_succeeds_once_space_frees() {
        let ingress = Arc::new(IngressChannel::new(1, 1.5, 0.9));
        let stats = Arc::new(StatsCollector::new());
        let mut strat = BlockStrategy::new();
        let perf = PerformanceConfig {
            block_timeout_ms: 0,
            ..Default::default()
        };
        strat
            .init(
                super::super::StrategyContext {
                    ingress: ingress.clone(),
                    stats,
                },
                &perf,
            )
            .await;

        ingress.try_send(rec(0)).unwrap();

        let pair = ingress.current();
        let drain = tokio::spawn(async move {
            let mut r = pair.receiver.lock().await;
            r.recv().await
        });

        let accepted = strat.process_data(rec(1)).await;
        assert!(accepted);
        drain.await.unwrap();
    }
}
