pub mod appresult;
pub mod auth;
pub mod config;
pub mod connection;
pub mod db;
pub mod hub;
pub mod index;
pub mod message;
pub mod res;
pub mod rooms;
pub mod session;
pub mod store;
pub mod users;

use std::{ops::Deref, sync::Arc};

use axum::{
    Router,
    extract::FromRef,
    response::{Html, IntoResponse},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::SameSite};

pub use appresult::{AppError, AppResult};

use crate::{
    auth::GoogleClient,
    config::ConnectionSettings,
    hub::Registry,
    store::{MessageStore, SqliteStore},
};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db: SqliteStore,
    pub messages: Arc<dyn MessageStore>,
    pub registry: Registry,
    pub google: Option<GoogleClient>,
    pub connection: ConnectionSettings,
}

impl AppState {
    /// Messages go to the same database as everything else unless
    /// [`AppState::with_message_store`] says otherwise.
    pub fn new(db: SqliteStore, registry: Registry, google: Option<GoogleClient>, connection: ConnectionSettings) -> Self {
        AppState {
            messages: Arc::new(db.clone()),
            db,
            registry,
            google,
            connection,
        }
    }

    pub fn with_message_store(mut self, messages: Arc<dyn MessageStore>) -> Self {
        self.messages = messages;
        self
    }
}

pub fn app(state: AppState, session_ttl_minutes: i64) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(session_ttl_minutes)));

    Router::new()
        .merge(index::router())
        .merge(auth::router())
        .merge(rooms::router())
        .merge(users::router())
        .with_state(state)
        .layer(session_layer)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub struct Markdown<T>(pub T);

impl<T> IntoResponse for Markdown<T>
where
    T: Deref<Target = str>,
{
    fn into_response(self) -> axum::response::Response {
        use pulldown_cmark::{Options, Parser};

        let parser = Parser::new_ext(&self.0, Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH);
        let mut html_output = String::new();
        pulldown_cmark::html::push_html(&mut html_output, parser);
        Html(html_output).into_response()
    }
}
