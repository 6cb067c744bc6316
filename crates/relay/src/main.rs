mod config;
mod error;
mod pump;
mod session;
mod site;
mod upstream;

use std::{path::Path, sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    http::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{RelayConfig, API_KEY_VAR, FOLDER_ID_VAR},
    error::{
        attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
        ErrorCode, RelayError,
    },
    session::RelayState,
    upstream::{RealtimeConnector, UpstreamConnector},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    if let Err(error) = config.ensure_credentials() {
        error!(error = %error, "cannot start without upstream credentials");
        return Err::<(), _>(error).with_context(|| {
            format!("Set env vars: {API_KEY_VAR} and {FOLDER_ID_VAR}, then run again.")
        });
    }

    // Exactly one provider is compiled in; an Err only means it is already set.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let connector =
        RealtimeConnector::from_config(&config).context("invalid upstream configuration")?;
    let connector_endpoint = connector.endpoint().clone();
    let addr = config.listen_addr();
    let shutdown = CancellationToken::new();
    let app = build_router(
        RelayState::new(Arc::new(config.clone()), connector, shutdown.clone()),
        &config.web_dir,
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {addr}"))?;

    info!(
        listen_addr = %addr,
        upstream = %connector_endpoint,
        "starting realtime relay"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .context("relay server exited unexpectedly")
}

fn build_router<C: UpstreamConnector>(state: RelayState<C>, web_dir: &Path) -> Router {
    apply_middleware(Router::new().merge(site::router(web_dir)).merge(session::router(state)))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
