use axum::{Router, response::Html, routing::get};

use crate::{AppState, Markdown, res};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(|| async { Html(res::INDEX_HTML) }))
        .route("/docs", get(|| async { Markdown(res::API_DOCS) }))
}
