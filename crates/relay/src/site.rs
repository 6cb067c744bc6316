// Browser-facing auxiliary routes: the demo page, its assets and a health probe.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{extract::State, response::Html, routing::get, Json, Router};
use serde::Serialize;
use tower_http::services::ServeDir;
use tracing::warn;

use crate::error::{ErrorCode, RelayError};

#[derive(Debug, Serialize)]
struct Health {
    ok: bool,
}

/// `/static` is only mounted when the directory exists at startup.
pub fn router(web_dir: &Path) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .with_state(Arc::new(web_dir.to_path_buf()));

    let static_dir = web_dir.join("static");
    if static_dir.is_dir() {
        router.nest_service("/static", ServeDir::new(static_dir))
    } else {
        router
    }
}

async fn index(State(web_dir): State<Arc<PathBuf>>) -> Result<Html<String>, RelayError> {
    let path = web_dir.join("index.html");
    tokio::fs::read_to_string(&path).await.map(Html).map_err(|error| {
        warn!(path = %path.display(), error = %error, "index page unavailable");
        RelayError::from_code(ErrorCode::NotFound)
    })
}

async fn healthz() -> Json<Health> {
    Json(Health { ok: true })
}
