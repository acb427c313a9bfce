//! Stream factory and public API (spec.md §4.I, §4.K, §6).
//!
//! `Stream::new` is the one place every other component gets wired
//! together: it validates the performance config, builds the chosen
//! backpressure strategy (special-casing `persist` so the persistence
//! manager can be attached directly, rather than threaded through the
//! generic strategy-registry interface), precompiles the projection
//! descriptors, and constructs the sink fan-out.
//!
//! The real system's window/aggregator implementations live outside
//! this crate's scope (spec.md §1); callers hand in ready-made
//! collaborators via [`StreamCollaborators`] rather than the core
//! constructing a tumbling/sliding/session window itself.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::backpressure::{OverflowStrategy, PersistStrategy, StrategyContext, StrategyRegistry};
use crate::config::Config;
use crate::error::{StreamSqlError, StreamSqlResult};
use crate::external::{Aggregator, Condition, ExpressionBridge, FunctionRegistry, Window};
use crate::ingress::IngressChannel;
use crate::metrics::{DetailedMetrics, MetricsSnapshot, MetricsSurface};
use crate::persistence::PersistenceManager;
use crate::processor::Processor;
use crate::projection::{self, project_record, CompiledExpressionDescriptor, CompiledFieldDescriptor};
use crate::sinks::{AsyncSink, ResultChannel, ResultFanout, SyncSink};
use crate::stats::StatsCollector;
use crate::value::Record;
use crate::window_batch::WindowBatchProcessor;

/// External collaborators the factory cannot construct itself (spec.md
/// §1 Out-of-scope, §6). `window`/`aggregator` are required iff
/// `config.needs_window()`.
pub struct StreamCollaborators {
    pub bridge: Arc<dyn ExpressionBridge>,
    pub window: Option<Box<dyn Window>>,
    pub aggregator: Option<Box<dyn Aggregator>>,
    /// Looked up for function-call simple-fields/expressions before
    /// falling back to `bridge.evaluate_expression` (spec.md §6).
    pub function_registry: Option<Arc<dyn FunctionRegistry>>,
}

pub struct Stream {
    config: Config,
    ingress: Arc<IngressChannel>,
    stats: Arc<StatsCollector>,
    fanout: Arc<ResultFanout>,
    strategy: Arc<dyn OverflowStrategy>,
    bridge: Arc<dyn ExpressionBridge>,
    function_registry: Option<Arc<dyn FunctionRegistry>>,
    simple_fields: Arc<Vec<CompiledFieldDescriptor>>,
    expressions: Arc<Vec<(String, CompiledExpressionDescriptor)>>,
    condition: StdMutex<Option<Arc<dyn Condition>>>,
    window: StdMutex<Option<Box<dyn Window>>>,
    aggregator: StdMutex<Option<Box<dyn Aggregator>>>,
    persistence: Option<Arc<PersistenceManager>>,
    metrics: Arc<MetricsSurface>,

    started: AtomicBool,
    stopped: AtomicBool,
    term_tx: watch::Sender<bool>,
    term_rx: watch::Receiver<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Stream {
    pub async fn new(config: Config, collaborators: StreamCollaborators) -> StreamSqlResult<Arc<Self>> {
        config.performance.validate()?;

        if config.needs_window() && (collaborators.window.is_none() || collaborators.aggregator.is_none()) {
            return Err(StreamSqlError::WindowConstruction(
                "a window query requires both a window and an aggregator collaborator".into(),
            ));
        }

        let perf = config.performance.clone();
        let bridge = collaborators.bridge;

        let simple_fields = Arc::new(projection::compile_fields(&config.simple_fields));
        let expressions = Arc::new(projection::compile_expressions(&config, bridge.as_ref()));

        let ingress = Arc::new(IngressChannel::new(
            perf.ingress_buffer_size,
            perf.expand_growth_factor,
            perf.expand_threshold,
        ));
        let stats = Arc::new(StatsCollector::new());
        let fanout = ResultFanout::new(perf.result_buffer_size, perf.sink_pool_size, perf.sink_worker_count, stats.clone());

        let ctx = StrategyContext {
            ingress: ingress.clone(),
            stats: stats.clone(),
        };

        let (strategy, persistence): (Arc<dyn OverflowStrategy>, Option<Arc<PersistenceManager>>) =
            if perf.overflow_strategy == "persist" {
                let persist_cfg = perf
                    .persistence
                    .as_ref()
                    .ok_or_else(|| StreamSqlError::Config("persist strategy requires a persistence config".into()))?;
                let manager = Arc::new(PersistenceManager::new(persist_cfg));
                manager.start().await?;
                manager.load_and_recover_data().await?;

                let mut s = PersistStrategy::new();
                s.init(ctx, &perf).await;
                s.attach_manager(manager.clone());
                (Arc::new(s), Some(manager))
            } else {
                let registry = StrategyRegistry::with_defaults();
                let mut s = registry.build(&perf.overflow_strategy);
                s.init(ctx, &perf).await;
                (Arc::from(s), None)
            };

        let metrics = Arc::new(MetricsSurface::new(
            ingress.clone(),
            stats.clone(),
            fanout.clone(),
            Arc::new(AtomicUsize::new(0)),
        )?);

        let (term_tx, term_rx) = watch::channel(false);

        info!(strategy = strategy.strategy_name(), needs_window = config.needs_window(), "stream constructed");

        Ok(Arc::new(Self {
            config,
            ingress,
            stats,
            fanout,
            strategy,
            bridge,
            function_registry: collaborators.function_registry,
            simple_fields,
            expressions,
            condition: StdMutex::new(None),
            window: StdMutex::new(collaborators.window),
            aggregator: StdMutex::new(collaborators.aggregator),
            persistence,
            metrics,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            term_tx,
            term_rx,
            tasks: StdMutex::new(Vec::new()),
        }))
    }

    /// Spawns the processor task, the window-batch task (iff
    /// `needs_window`), and a fallback result-consumer task. Idempotent:
    /// a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let condition = self.condition.lock().unwrap().clone();

        if self.config.needs_window() {
            let window = self.window.lock().unwrap().take().expect("validated at construction");
            let aggregator = self.aggregator.lock().unwrap().take().expect("validated at construction");
            let processor = WindowBatchProcessor {
                window,
                aggregator,
                bridge: self.bridge.clone(),
                having: self.config.having.clone(),
                distinct: self.config.distinct,
                limit: self.config.limit,
                fanout: self.fanout.clone(),
                stats: self.stats.clone(),
                term: self.term_rx.clone(),
            };
            self.tasks.lock().unwrap().push(tokio::spawn(processor.run()));
        } else {
            let processor = Processor {
                ingress: self.ingress.clone(),
                stats: self.stats.clone(),
                fanout: self.fanout.clone(),
                condition,
                bridge: self.bridge.clone(),
                function_registry: self.function_registry.clone(),
                simple_fields: self.simple_fields.clone(),
                expressions: self.expressions.clone(),
                window: None,
                term: self.term_rx.clone(),
            };
            self.tasks.lock().unwrap().push(tokio::spawn(processor.run()));
        }

        // Fallback result-consumer: drains `results_chan` alongside any
        // external consumer so the bounded result channel never backs up
        // when nobody reads it (spec.md §4.I, §5).
        let chan = self.fanout.results_chan();
        let mut term = self.term_rx.clone();
        self.tasks.lock().unwrap().push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = term.changed() => {
                        if changed.is_err() || *term.borrow() {
                            break;
                        }
                    }
                    batch = chan.recv() => {
                        if batch.is_none() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Idempotent: signals termination, joins spawned tasks, stops the
    /// strategy and (if present) the persistence manager.
    pub async fn stop(&self) -> StreamSqlResult<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _ = self.term_tx.send(true);

        let handles = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }

        self.strategy.stop().await;
        self.fanout.stop();

        if let Some(manager) = &self.persistence {
            manager.stop().await?;
        }

        info!("stream stopped");
        Ok(())
    }

    /// Accepts one record via the configured backpressure strategy.
    /// Fails once the stream has observed `stop()` (spec.md §3: "the
    /// stream transitions stopped=1 exactly once; all sends after this
    /// observation must fail").
    pub async fn emit(&self, record: Record) -> StreamSqlResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(StreamSqlError::Stopped);
        }
        self.strategy.process_data(record).await;
        Ok(())
    }

    pub async fn add_sink(&self, sink: impl SyncSink + 'static) {
        self.fanout.add_sink(Arc::new(sink)).await;
    }

    pub async fn add_async_sink(&self, sink: impl AsyncSink + 'static) {
        self.fanout.add_async_sink(Arc::new(sink)).await;
    }

    pub fn results_chan(&self) -> ResultChannel {
        self.fanout.results_chan()
    }

    /// Installs the WHERE predicate. Only valid before `start` (spec.md
    /// §6); the processor captures a snapshot of the condition at spawn
    /// time, so a later registration would silently have no effect.
    pub fn register_filter(&self, text: &str) -> StreamSqlResult<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(StreamSqlError::Config(
                "register_filter must be called before start".into(),
            ));
        }
        let condition: Arc<dyn Condition> = Arc::from(self.bridge.compile_condition(text)?);
        *self.condition.lock().unwrap() = Some(condition);
        Ok(())
    }

    pub fn get_stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn get_detailed_stats(&self) -> DetailedMetrics {
        self.metrics.detailed()
    }

    pub fn reset_stats(&self) {
        self.metrics.reset_stats();
    }

    /// Synchronous, non-aggregating evaluation (spec.md §4.K). Bypasses
    /// channels and sinks entirely.
    pub fn process_sync(&self, record: &Record) -> StreamSqlResult<Option<Record>> {
        if self.config.needs_window() {
            return Err(StreamSqlError::SyncAggregation);
        }

        let condition = self.condition.lock().unwrap().clone();
        if let Some(condition) = condition {
            if !condition.evaluate(record) {
                return Ok(None);
            }
        }

        Ok(Some(project_record(
            record,
            &self.simple_fields,
            &self.expressions,
            self.bridge.as_ref(),
            self.function_registry.as_deref(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamSqlResult as Result_;
    use crate::value::Value;

    struct PassthroughBridge;
    impl ExpressionBridge for PassthroughBridge {
        fn compile_condition(&self, text: &str) -> Result_<Box<dyn Condition>> {
            let threshold: f64 = text
                .rsplit("> ")
                .next()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0.0);
            Ok(Box::new(GreaterThan {
                field: "temperature".to_string(),
                threshold,
            }))
        }
        fn compile_expression(&self, _text: &str) -> Result_<Box<dyn crate::external::Expression>> {
            unimplemented!()
        }
        fn evaluate_expression(&self, _text: &str, _record: &Record) -> Result_<Value> {
            Ok(Value::Null)
        }
        fn preprocess_is_null_expression(&self, text: &str) -> String {
            text.to_string()
        }
        fn preprocess_like_expression(&self, text: &str) -> String {
            text.to_string()
        }
        fn preprocess_backtick_identifiers(&self, text: &str) -> String {
            text.to_string()
        }
        fn contains_is_null_operator(&self, _text: &str) -> bool {
            false
        }
        fn contains_like_operator(&self, _text: &str) -> bool {
            false
        }
        fn contains_backtick_identifiers(&self, _text: &str) -> bool {
            false
        }
    }

    struct GreaterThan {
        field: String,
        threshold: f64,
    }
    impl Condition for GreaterThan {
        fn evaluate(&self, record: &Record) -> bool {
            record.get(&self.field).and_then(|v| v.as_f64()).unwrap_or(f64::MIN) > self.threshold
        }
    }

    fn rec(device: &str, temp: f64) -> Record {
        let mut r = Record::new();
        r.insert("device".to_string(), Value::String(device.to_string()));
        r.insert("temperature".to_string(), Value::Number(temp));
        r
    }

    #[tokio::test]
    async fn process_sync_matches_scenario_s4() {
        let config = Config {
            predicate: Some("temperature > 30".to_string()),
            ..Default::default()
        };
        let stream = Stream::new(
            config,
            StreamCollaborators {
                bridge: Arc::new(PassthroughBridge),
                window: None,
                aggregator: None,
                function_registry: None,
            },
        )
        .await
        .unwrap();
        stream.register_filter("temperature > 30").unwrap();

        assert_eq!(stream.process_sync(&rec("s1", 25.0)).unwrap(), None);
        assert_eq!(
            stream.process_sync(&rec("s2", 35.0)).unwrap(),
            Some(rec("s2", 35.0))
        );
    }

    #[tokio::test]
    async fn process_sync_rejects_window_queries() {
        let config = Config {
            group_by: vec!["device".to_string()],
            ..Default::default()
        };
        struct DummyWindow;
        impl Window for DummyWindow {
            fn start(&mut self) {}
            fn add(&mut self, _record: Record) {}
            fn take_output(&mut self) -> tokio::sync::mpsc::Receiver<crate::external::Batch> {
                tokio::sync::mpsc::channel(1).1
            }
        }
        struct DummyAggregator;
        impl Aggregator for DummyAggregator {
            fn put(&mut self, _field: &str, _value: Value) {}
            fn add(&mut self, _record: &Record) -> Result_<()> {
                Ok(())
            }
            fn get_results(&mut self) -> Result_<Vec<Record>> {
                Ok(vec![])
            }
            fn reset(&mut self) {}
            fn register_expression(&mut self, _name: &str, _expr_text: &str, _referenced_fields: &[String]) {}
        }

        let stream = Stream::new(
            config,
            StreamCollaborators {
                bridge: Arc::new(PassthroughBridge),
                window: Some(Box::new(DummyWindow)),
                aggregator: Some(Box::new(DummyAggregator)),
                function_registry: None,
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            stream.process_sync(&rec("s1", 1.0)),
            Err(StreamSqlError::SyncAggregation)
        ));
    }

    #[tokio::test]
    async fn emit_and_stop_drop_strategy_counters_match_scenario_s5() {
        let config = Config {
            performance: crate::config::PerformanceConfig {
                ingress_buffer_size: 2,
                overflow_strategy: "drop".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let stream = Stream::new(
            config,
            StreamCollaborators {
                bridge: Arc::new(PassthroughBridge),
                window: None,
                aggregator: None,
                function_registry: None,
            },
        )
        .await
        .unwrap();

        for i in 0..10 {
            stream.emit(rec("s", i as f64)).await.unwrap();
        }

        stream.stop().await.unwrap();

        assert!(matches!(
            stream.emit(rec("late", 1.0)).await,
            Err(StreamSqlError::Stopped)
        ));
    }
}
