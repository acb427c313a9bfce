//! External collaborator interfaces (spec.md §6).
//!
//! These traits are the seams the core calls through; it never implements
//! SQL parsing, a window algorithm, an aggregation algorithm, or an
//! expression evaluator. `Window`/`Aggregator`/`Condition`/`Expression` are
//! driven synchronously from the processor's own tokio task (the spec's
//! external interfaces are plain calls, not async I/O), so they take no
//! `async fn` and need no `async-trait` boxing.

use crate::value::{Record, Value};
use crate::error::StreamSqlResult;

/// A half-open time interval identifying the window instance that
/// produced a batch (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSlot {
    pub start_ns: i64,
    pub end_ns: i64,
}

/// A `(record, slot)` pair emitted by a window.
#[derive(Debug, Clone)]
pub struct Row {
    pub data: Record,
    pub slot: WindowSlot,
}

/// A batch of rows a window emits when it closes.
pub type Batch = Vec<Row>;

/// The window abstraction the core consumes (spec.md §6). Implementations
/// (tumbling/sliding/counting/session) live outside this crate's scope;
/// the core only needs to feed records in and drain batches out.
pub trait Window: Send {
    fn start(&mut self);
    fn add(&mut self, record: Record);
    /// Hands out the batch receiver once; called by the window-batch
    /// processor at startup.
    fn take_output(&mut self) -> tokio::sync::mpsc::Receiver<Batch>;
}

/// The aggregator abstraction the core consumes (spec.md §6).
pub trait Aggregator: Send {
    fn put(&mut self, field: &str, value: Value);
    fn add(&mut self, record: &Record) -> StreamSqlResult<()>;
    fn get_results(&mut self) -> StreamSqlResult<Vec<Record>>;
    fn reset(&mut self);
    fn register_expression(
        &mut self,
        name: &str,
        expr_text: &str,
        referenced_fields: &[String],
    );
}

/// A compiled WHERE/HAVING predicate.
pub trait Condition: Send + Sync {
    fn evaluate(&self, record: &Record) -> bool;
}

/// A compiled projection/HAVING expression.
pub trait Expression: Send + Sync {
    fn evaluate(&self, record: &Record) -> f64;
    fn evaluate_value_with_null(&self, record: &Record) -> StreamSqlResult<(Value, bool)>;
}

/// Text-preprocessing and evaluation capabilities the processor depends
/// on but does not implement itself (spec.md §6, §9).
pub trait ExpressionBridge: Send + Sync {
    fn compile_condition(&self, text: &str) -> StreamSqlResult<Box<dyn Condition>>;
    fn compile_expression(&self, text: &str) -> StreamSqlResult<Box<dyn Expression>>;
    fn evaluate_expression(&self, text: &str, record: &Record) -> StreamSqlResult<Value>;

    fn preprocess_is_null_expression(&self, text: &str) -> String;
    fn preprocess_like_expression(&self, text: &str) -> String;
    fn preprocess_backtick_identifiers(&self, text: &str) -> String;

    fn contains_is_null_operator(&self, text: &str) -> bool;
    fn contains_like_operator(&self, text: &str) -> bool;
    fn contains_backtick_identifiers(&self, text: &str) -> bool;
}

pub trait SqlFunction: Send + Sync {
    fn execute(&self, ctx: &Record, args: &[Value]) -> StreamSqlResult<Value>;
}

pub trait FunctionRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<&dyn SqlFunction>;
}
