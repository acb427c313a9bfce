//! Persist strategy (spec.md §4.C).
//!
//! Routes through the durable-overflow manager. While the manager is in
//! recovery mode, every call first tries to drain one recovered record
//! ahead of the new one (so replay makes forward progress even under
//! steady new-record pressure); outside recovery mode it is a simple
//! try-send-then-persist policy, with a bounded number of background
//! recovery-check tasks draining the backlog as ingress capacity frees up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;

use crate::config::PerformanceConfig;
use crate::persistence::PersistenceManager;
use crate::value::Record;

use super::{OverflowStrategy, StrategyContext};

const RECOVERY_CHECK_LIFETIME: Duration = Duration::from_secs(30);

pub struct PersistStrategy {
    ctx: OnceLock<StrategyContext>,
    manager: OnceLock<Arc<PersistenceManager>>,
    active_retries: Arc<AtomicUsize>,
    max_retry_routines: usize,
    retry_interval: Duration,
}

impl PersistStrategy {
    pub fn new() -> Self {
        Self {
            ctx: OnceLock::new(),
            manager: OnceLock::new(),
            active_retries: Arc::new(AtomicUsize::new(0)),
            max_retry_routines: 5,
            retry_interval: Duration::from_secs(2),
        }
    }

    /// Installs the durable-overflow manager this strategy forwards to.
    /// Called by the stream factory alongside `init`, since the manager
    /// is owned by the stream, not the strategy.
    pub fn attach_manager(&self, manager: Arc<PersistenceManager>) {
        let _ = self.manager.set(manager);
    }

    async fn handle_recovery_mode(
        &self,
        ctx: &StrategyContext,
        manager: &Arc<PersistenceManager>,
        record: Record,
    ) -> bool {
        let Some((recovered, _has_more)) = manager.get_recovery_data().await else {
            return self.handle_normal(ctx, manager, record).await;
        };

        match ctx.ingress.try_send(recovered.record.clone()) {
            Ok(()) => match ctx.ingress.try_send(record) {
                Ok(()) => true,
                Err(r) => {
                    let _ = manager.persist_with_retry_limit(r, 0).await;
                    true
                }
            },
            Err(_) => {
                if manager.should_retry_recovered_data(&recovered) {
                    let _ = manager.repersist_recovered_data(recovered).await;
                } else {
                    manager
                        .move_to_dead_letter_queue(recovered.record.clone(), "max retry count exceeded")
                        .await;
                }
                let _ = manager.persist_data(record).await;
                true
            }
        }
    }

    async fn handle_normal(
        &self,
        ctx: &StrategyContext,
        manager: &Arc<PersistenceManager>,
        record: Record,
    ) -> bool {
        if ctx.ingress.try_send(record.clone()).is_ok() {
            return true;
        }

        let _ = manager.persist_data(record).await;

        if self.active_retries.load(Ordering::Acquire) < self.max_retry_routines {
            self.spawn_recovery_check(ctx.ingress.clone(), manager.clone());
        }
        true
    }

    fn spawn_recovery_check(
        &self,
        ingress: Arc<crate::ingress::IngressChannel>,
        manager: Arc<PersistenceManager>,
    ) {
        self.active_retries.fetch_add(1, Ordering::AcqRel);
        let active_retries = self.active_retries.clone();
        let retry_interval = self.retry_interval;

        tokio::spawn(async move {
            let deadline = Instant::now() + RECOVERY_CHECK_LIFETIME;
            loop {
                if Instant::now() >= deadline {
                    break;
                }
                if !manager.is_in_recovery_mode().await {
                    break;
                }
                tokio::time::sleep(retry_interval).await;

                if let Some((recovered, _)) = manager.get_recovery_data().await {
                    if ingress.try_send(recovered.record.clone()).is_err() {
                        if manager.should_retry_recovered_data(&recovered) {
                            let _ = manager.repersist_recovered_data(recovered).await;
                        } else {
                            manager
                                .move_to_dead_letter_queue(recovered.record.clone(), "max retry count exceeded")
                                .await;
                        }
                    }
                }
            }
            active_retries.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

impl Default for PersistStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OverflowStrategy for PersistStrategy {
    async fn init(&mut self, ctx: StrategyContext, perf: &PerformanceConfig) {
        self.max_retry_routines = perf.max_retry_routines;
        if let Some(p) = &perf.persistence {
            self.retry_interval = p.retry_interval();
        }
        let _ = self.ctx.set(ctx);
    }

    async fn process_data(&self, record: Record) -> bool {
        let Some(ctx) = self.ctx.get() else {
            return false;
        };
        let Some(manager) = self.manager.get() else {
            warn!("persist strategy used without an attached persistence manager");
            return ctx.ingress.try_send(record).is_ok();
        };

        if manager.is_in_recovery_mode().await {
            self.handle_recovery_mode(ctx, manager, record).await
        } else {
            self.handle_normal(ctx, manager, record).await
        }
    }

    fn strategy_name(&self) -> &'static str {
        "persist"
    }

    async fn stop(&self) {
        if let Some(manager) = self.manager.get() {
            let _ = manager.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceConfig;
    use crate::ingress::IngressChannel;
    use crate::stats::StatsCollector;
    use crate::value::Value;

    fn rec(n: i64) -> Record {
        let mut r = Record::new();
        r.insert("n".to_string(), Value::Number(n as f64));
        r
    }

    async fn persist_cfg(dir: &std::path::Path) -> PersistenceConfig {
        PersistenceConfig {
            data_dir: dir.to_string_lossy().to_string(),
            max_file_size_bytes: 10 * 1024 * 1024,
            flush_interval_ms: 60_000,
            max_retries: 2,
            retry_interval_ms: 50,
        }
    }

    #[tokio::test]
    async fn full_channel_persists_new_record() {
        let dir = std::env::temp_dir().join(format!("streamsql_persist_test_{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let cfg = persist_cfg(&dir).await;
        let manager = Arc::new(PersistenceManager::new(&cfg));
        manager.start().await.unwrap();

        let ingress = Arc::new(IngressChannel::new(1, 1.5, 0.9));
        let stats = Arc::new(StatsCollector::new());
        ingress.try_send(rec(0)).unwrap();

        let mut strat = PersistStrategy::new();
        strat
            .init(
                super::super::StrategyContext {
                    ingress: ingress.clone(),
                    stats,
                },
                &PerformanceConfig::default(),
            )
            .await;
        strat.attach_manager(manager.clone());

        let accepted = strat.process_data(rec(1)).await;
        assert!(accepted);

        let persisted = manager.get_stats().await.total_persisted;
        assert_eq!(persisted, 1);

        manager.stop().await.unwrap();
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
