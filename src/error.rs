use thiserror::Error;

/// Crate-wide result type.
pub type StreamSqlResult<T> = std::result::Result<T, StreamSqlError>;

#[derive(Debug, Error)]
pub enum StreamSqlError {
    // =========
    // Construction-time
    // =========
    #[error("invalid performance config: {0}")]
    Config(String),

    #[error("window construction error: {0}")]
    WindowConstruction(String),

    // =========
    // Filter / expression compilation
    // =========
    #[error("filter compile error ({kind}): {message}")]
    FilterCompile { kind: &'static str, message: String },

    #[error("evaluation error in {site}: {message}")]
    Evaluation { site: &'static str, message: String },

    // =========
    // Synchronous path
    // =========
    #[error("synchronous processing not supported for aggregation")]
    SyncAggregation,

    // =========
    // Persistence (logged internally; surfaced only for Start/Stop failures)
    // =========
    #[error("persistence error: {0}")]
    Persistence(String),

    // =========
    // Ambient
    // =========
    #[error("config file io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[cfg(feature = "metrics")]
    #[error("prometheus registry error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("stream already stopped")]
    Stopped,
}
