//! Data processor — the main pipeline loop (spec.md §4.F).
//!
//! Each iteration re-fetches the current ingress-channel reference (an
//! expansion may have swapped it since the last iteration), then selects
//! across the channel receive, the termination signal, and a 100 ms
//! heartbeat tick that exists solely to keep re-fetching the reference
//! rather than parking forever on a stale one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::external::{Condition, Expression, ExpressionBridge, FunctionRegistry, Window};
use crate::ingress::IngressChannel;
use crate::projection::{project_record, CompiledExpressionDescriptor, CompiledFieldDescriptor};
use crate::sinks::ResultFanout;
use crate::stats::StatsCollector;
use crate::value::Record;

const HEARTBEAT: Duration = Duration::from_millis(100);

pub struct Processor {
    pub ingress: Arc<IngressChannel>,
    pub stats: Arc<StatsCollector>,
    pub fanout: Arc<ResultFanout>,
    pub condition: Option<Arc<dyn Condition>>,
    pub bridge: Arc<dyn ExpressionBridge>,
    pub function_registry: Option<Arc<dyn FunctionRegistry>>,
    pub simple_fields: Arc<Vec<CompiledFieldDescriptor>>,
    pub expressions: Arc<Vec<(String, CompiledExpressionDescriptor)>>,
    pub window: Option<Box<dyn Window>>,
    pub term: watch::Receiver<bool>,
}

impl Processor {
    pub async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT);

        'outer: loop {
            let pair = self.ingress.current();
            let maybe_record = {
                let mut receiver = pair.receiver.lock().await;
                loop {
                    tokio::select! {
                        biased;
                        changed = self.term.changed() => {
                            if changed.is_err() || *self.term.borrow() {
                                break 'outer;
                            }
                        }
                        maybe = receiver.recv() => break maybe,
                        _ = heartbeat.tick() => {}
                    }
                }
            };
            drop(pair);

            match maybe_record {
                Some(record) => {
                    self.stats.inc_input();
                    self.handle_record(record).await;
                }
                None => break,
            }
        }

        info!("processor task exiting");
    }

    async fn handle_record(&mut self, record: Record) {
        if let Some(condition) = &self.condition {
            if !condition.evaluate(&record) {
                return;
            }
        }

        if let Some(window) = &mut self.window {
            window.add(record);
            return;
        }

        let result = project_record(
            &record,
            &self.simple_fields,
            &self.expressions,
            self.bridge.as_ref(),
            self.function_registry.as_deref(),
        );
        self.stats.inc_output();
        self.fanout.emit(vec![result]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamSqlResult;
    use crate::value::Value;

    struct AlwaysTrue;
    impl Condition for AlwaysTrue {
        fn evaluate(&self, _record: &Record) -> bool {
            true
        }
    }

    struct TempAbove30;
    impl Condition for TempAbove30 {
        fn evaluate(&self, record: &Record) -> bool {
            record.get("temperature").and_then(|v| v.as_f64()).unwrap_or(0.0) > 30.0
        }
    }

    struct NoopBridge;
    impl ExpressionBridge for NoopBridge {
        fn compile_condition(&self, _text: &str) -> StreamSqlResult<Box<dyn Condition>> {
            unimplemented!()
        }
        fn compile_expression(&self, _text: &str) -> StreamSqlResult<Box<dyn Expression>> {
            unimplemented!()
        }
        fn evaluate_expression(&self, _text: &str, _record: &Record) -> StreamSqlResult<Value> {
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

    fn rec(device: &str, temp: f64) -> Record {
        let mut r = Record::new();
        r.insert("device".to_string(), Value::String(device.to_string()));
        r.insert("temperature".to_string(), Value::Number(temp));
        r
    }

    fn processor(condition: Option<Arc<dyn Condition>>) -> (Processor, watch::Sender<bool>) {
        let ingress = Arc::new(IngressChannel::new(16, 1.5, 0.9));
        let stats = Arc::new(StatsCollector::new());
        let fanout = ResultFanout::new(16, 16, 2, stats.clone());
        let (term_tx, term_rx) = watch::channel(false);
        (
            Processor {
                ingress,
                stats,
                fanout,
                condition,
                bridge: Arc::new(NoopBridge),
                function_registry: None,
                simple_fields: Arc::new(vec![]),
                expressions: Arc::new(vec![]),
                window: None,
                term: term_rx,
            },
            term_tx,
        )
    }

    #[tokio::test]
    async fn where_clause_filters_silently_without_counting_as_dropped() {
        let (processor, term_tx) = processor(Some(Arc::new(TempAbove30)));
        let ingress = processor.ingress.clone();
        let stats = processor.stats.clone();
        let chan = processor.fanout.results_chan();

        let handle = tokio::spawn(processor.run());
        ingress.try_send(rec("s1", 25.0)).unwrap();
        ingress.try_send(rec("s2", 35.0)).unwrap();

        let batch = chan.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].get("device"), Some(&Value::String("s2".into())));

        term_tx.send(true).unwrap();
        handle.await.unwrap();

        let snap = stats.snapshot();
        assert_eq!(snap.input_count, 2);
        assert_eq!(snap.output_count, 1);
        assert_eq!(snap.dropped_count, 0);
    }

    #[tokio::test]
    async fn full_passthrough_emits_clone_of_input() {
        let (processor, term_tx) = processor(Some(Arc::new(AlwaysTrue)));
        let ingress = processor.ingress.clone();
        let chan = processor.fanout.results_chan();
        let handle = tokio::spawn(processor.run());

        ingress.try_send(rec("s1", 12.0)).unwrap();
        let batch = chan.recv().await.unwrap();
        assert_eq!(batch[0], rec("s1", 12.0));

        term_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
