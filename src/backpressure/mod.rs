//! Backpressure strategies (spec.md §4.C).
//!
//! A polymorphic family over `{init, process_data, name, stop}`, registered
//! by name in a per-factory registry (spec.md §9: "re-model as a
//! per-factory registry instance ... avoid singletons").

mod block;
mod drop_strategy;
mod expand;
mod persist;

pub use block::BlockStrategy;
pub use drop_strategy::DropStrategy;
pub use expand::ExpandStrategy;
pub use persist::PersistStrategy;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PerformanceConfig;
use crate::ingress::IngressChannel;
use crate::stats::StatsCollector;
use crate::value::Record;

/// Shared context every strategy needs: the ingress channel it pushes
/// into and the stats collector it increments on drop.
pub struct StrategyContext {
    pub ingress: Arc<IngressChannel>,
    pub stats: Arc<StatsCollector>,
}

#[async_trait]
pub trait OverflowStrategy: Send + Sync {
    /// Called once at factory time with the wired context and performance
    /// config.
    async fn init(&mut self, ctx: StrategyContext, perf: &PerformanceConfig);

    /// Attempts to deliver one record, applying whatever policy this
    /// strategy implements. Returns `true` if the record was accepted
    /// into the ingress channel (immediately or after a retry/persist
    /// hand-off), `false` if it was dropped.
    async fn process_data(&self, record: Record) -> bool;

    fn strategy_name(&self) -> &'static str;

    async fn stop(&self);
}

/// Per-factory strategy registry (never a process-wide singleton).
/// Lookups of unknown names fall back to `drop`.
pub struct StrategyRegistry {
    factories: HashMap<String, Box<dyn Fn() -> Box<dyn OverflowStrategy> + Send + Sync>>,
}

impl StrategyRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("drop", || Box::new(DropStrategy::new()));
        registry.register("block", || Box::new(BlockStrategy::new()));
        registry.register("expand", || Box::new(ExpandStrategy::new()));
        registry.register("persist", || Box::new(PersistStrategy::new()));
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn OverflowStrategy> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Unknown names resolve to the `drop` strategy (spec.md §4.C).
    pub fn build(&self, name: &str) -> Box<dyn OverflowStrategy> {
        match self.factories.get(name) {
            Some(factory) => factory(),
            None => match self.factories.get("drop") {
                Some(factory) => factory(),
                None => Box::new(DropStrategy::new()),
            },
        }
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_strategy_name_falls_back_to_drop() {
        let registry = StrategyRegistry::with_defaults();
        let strategy = registry.build("does-not-exist");
        assert_eq!(strategy.strategy_name(), "drop");
    }

    #[test]
    fn known_strategies_resolve_by_name() {
        let registry = StrategyRegistry::with_defaults();
        assert_eq!(registry.build("block").strategy_name(), "block");
        assert_eq!(registry.build("expand").strategy_name(), "expand");
        assert_eq!(registry.build("persist").strategy_name(), "persist");
    }

    #[test]
    fn custom_strategy_can_be_registered() {
        let mut registry = StrategyRegistry::with_defaults();
        registry.register("custom", || Box::new(DropStrategy::new()));
        assert!(registry.build("custom").strategy_name() == "drop");
    }
}
