//! HTTP handlers: metrics, health and a landing page.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tower_http::compression::CompressionLayer;
use tracing::error;

use ibexporter_core::Scraper;
use ibexporter_core::command::CommandRunner;
use ibexporter_core::exposition::{self, CONTENT_TYPE};

const LANDING_PAGE: &str = r#"<html>
<head><title>InfiniBand Exporter</title></head>
<body>
<h1>InfiniBand Exporter</h1>
<p><a href="/metrics">Metrics</a></p>
</body>
</html>
"#;

/// Builds the exporter's router around a shared scraper.
pub(crate) fn router<R>(scraper: Arc<Scraper<R>>) -> Router
where
    R: CommandRunner + 'static,
{
    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics::<R>))
        .with_state(scraper)
        .layer(CompressionLayer::new())
}

// ============================================================
// Metrics
// ============================================================

pub(crate) async fn handle_metrics<R>(State(scraper): State<Arc<Scraper<R>>>) -> Response
where
    R: CommandRunner + 'static,
{
    let outcome = scraper.scrape().await;
    match exposition::render(&outcome) {
        Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ============================================================
// Health and index
// ============================================================

pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

pub(crate) async fn handle_index() -> Html<&'static str> {
    Html(LANDING_PAGE)
}
