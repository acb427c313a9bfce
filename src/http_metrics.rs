//! Optional HTTP metrics endpoint (spec.md §4.J, ambient), gated behind
//! the `http-metrics` feature. Grounded on `prometheus/server.rs`'s axum
//! server: a single configurable route returning the registry's text
//! exposition format.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::error::{StreamSqlError, StreamSqlResult};
use crate::metrics::MetricsSurface;

#[derive(Clone)]
struct AppState {
    metrics: Arc<MetricsSurface>,
}

pub async fn run_metrics_server(
    bind_addr: &str,
    port: u16,
    path: &str,
    metrics: Arc<MetricsSurface>,
) -> StreamSqlResult<()> {
    let addr: SocketAddr = format!("{bind_addr}:{port}")
        .parse()
        .map_err(|e| StreamSqlError::Config(format!("invalid metrics bind address: {e}")))?;

    let state = AppState { metrics };
    let app = Router::new().route(path, get(metrics_handler)).with_state(state);

    tracing::info!(%bind_addr, port, path, "streamsql metrics server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(|e| StreamSqlError::Config(format!("metrics server error: {e}")))?;

    Ok(())
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.encode_text() {
        Ok(text) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8".parse().unwrap(),
            );
            (StatusCode::OK, headers, text).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to gather streamsql metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "gather metrics failed\n").into_response()
        }
    }
}
