//! A streaming SQL execution engine core (spec.md §1).
//!
//! `Stream` is the crate's primary entry point: build a [`config::Config`],
//! hand in the external collaborators the real system's SQL compiler
//! would otherwise supply (window, aggregator, expression bridge), and
//! call [`stream::Stream::new`].

pub mod backpressure;
pub mod config;
pub mod error;
pub mod external;
#[cfg(feature = "http-metrics")]
pub mod http_metrics;
pub mod ingress;
pub mod metrics;
pub mod persistence;
pub mod processor;
pub mod projection;
pub mod sinks;
pub mod stats;
pub mod stream;
pub mod value;
pub mod window_batch;

pub use config::{Config, FieldExpression, PerformanceConfig, PersistenceConfig, WindowSpec};
pub use error::{StreamSqlError, StreamSqlResult};
pub use external::{Aggregator, Batch as WindowBatch, Condition, Expression, ExpressionBridge, FunctionRegistry, Row, SqlFunction, Window, WindowSlot};
pub use sinks::{AsyncSink, Batch, ResultChannel, SyncSink};
pub use stats::{PerformanceLevel, StatsSnapshot};
pub use stream::{Stream, StreamCollaborators};
pub use value::{Record, Value};
