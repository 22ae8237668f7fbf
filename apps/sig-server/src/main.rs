mod state;
mod ws;

use std::net::SocketAddr;

use axum::extract::{MatchedPath, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{body::Body, Router};
use tower_http::trace::TraceLayer;
use tracing_subscriber::prelude::*;

use state::AppState;

async fn metrics_handler(State(state): State<AppState>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(state.metrics.encode()))
        .unwrap()
        .into_response()
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/asr/stream", get(ws::stream_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let path = request.uri().path();
                let matched_path = request
                    .extensions()
                    .get::<MatchedPath>()
                    .map(MatchedPath::as_str)
                    .unwrap_or(path);
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    http.route = %matched_path,
                )
            }),
        )
        .with_state(state)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = sig_config::GatewayConfig::load()?;
    let port = config.port;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let state = AppState::build(config).await?;

            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            tracing::info!(addr = %addr, "gateway_listening");

            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app(state))
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            Ok::<(), anyhow::Error>(())
        })?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("shutdown_signal_received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthz_reports_ok() {
        assert_eq!(healthz().await, StatusCode::OK);
    }
}
