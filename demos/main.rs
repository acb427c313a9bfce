//! Demo binary: wires a [`Stream`] end to end against a synthetic record
//! source. The real system's SQL compiler (parsing WHERE/HAVING text into
//! `Condition`/`Expression`, and building the window/aggregator pair) is
//! out of scope for this crate (spec.md §1); this binary stands in with a
//! minimal comparison-only bridge, enough to demonstrate the pipeline.

mod cli;

use std::sync::Arc;

use clap::Parser;
use streamsql_core::{Config, Record, Stream, StreamCollaborators, Value};
use tracing::info;

use cli::Cli;

/// A comparison-only `ExpressionBridge` stand-in: understands
/// `"<field> > <number>"` and `"<field> < <number>"` WHERE clauses and
/// nothing else. A real deployment plugs in the SQL compiler's bridge
/// instead.
struct ComparisonBridge;

struct Threshold {
    field: String,
    greater: bool,
    value: f64,
}

impl streamsql_core::Condition for Threshold {
    fn evaluate(&self, record: &Record) -> bool {
        let Some(actual) = record.get(&self.field).and_then(|v| v.as_f64()) else {
            return false;
        };
        if self.greater {
            actual > self.value
        } else {
            actual < self.value
        }
    }
}

impl streamsql_core::ExpressionBridge for ComparisonBridge {
    fn compile_condition(&self, text: &str) -> streamsql_core::StreamSqlResult<Box<dyn streamsql_core::Condition>> {
        let (op, greater) = if text.contains('>') {
            ('>', true)
        } else if text.contains('<') {
            ('<', false)
        } else {
            return Err(streamsql_core::StreamSqlError::FilterCompile {
                kind: "where",
                message: format!("unsupported predicate: {text}"),
            });
        };

        let mut parts = text.splitn(2, op);
        let field = parts.next().unwrap_or_default().trim().to_string();
        let value: f64 = parts
            .next()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|e| streamsql_core::StreamSqlError::FilterCompile {
                kind: "where",
                message: format!("bad threshold in '{text}': {e}"),
            })?;

        Ok(Box::new(Threshold { field, greater, value }))
    }

    fn compile_expression(&self, text: &str) -> streamsql_core::StreamSqlResult<Box<dyn streamsql_core::Expression>> {
        Err(streamsql_core::StreamSqlError::FilterCompile {
            kind: "expression",
            message: format!("expressions not supported by the demo bridge: {text}"),
        })
    }

    fn evaluate_expression(&self, text: &str, _record: &Record) -> streamsql_core::StreamSqlResult<Value> {
        Err(streamsql_core::StreamSqlError::Evaluation {
            site: "demo bridge",
            message: format!("no function support for '{text}'"),
        })
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

fn synthetic_record(i: u64) -> Record {
    let mut r = Record::new();
    r.insert("device".to_string(), Value::String(format!("sensor-{}", i % 3)));
    r.insert("temperature".to_string(), Value::Number(20.0 + (i % 25) as f64));
    r
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.workers)
        .enable_all()
        .build()?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_text = tokio::fs::read_to_string(&cli.config).await?;
    let config: Config = toml::from_str(&config_text)?;
    let predicate = config.predicate.clone();

    let stream = Stream::new(
        config,
        StreamCollaborators {
            bridge: Arc::new(ComparisonBridge),
            window: None,
            aggregator: None,
            function_registry: None,
        },
    )
    .await?;

    if let Some(predicate) = predicate {
        stream.register_filter(&predicate)?;
    }

    stream.start();

    let chan = stream.results_chan();
    let printer = tokio::spawn(async move {
        while let Some(batch) = chan.recv().await {
            for record in batch {
                info!(?record, "result");
            }
        }
    });

    for i in 0..cli.record_count {
        stream.emit(synthetic_record(i)).await?;
    }

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    stream.stop().await?;
    printer.abort();

    let stats = stream.get_detailed_stats();
    info!(?stats, "final stats");

    Ok(())
}

