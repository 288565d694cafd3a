use anyhow::Context;
use huddle::{
    AppState, app,
    auth::GoogleClient,
    config::Config,
    db,
    hub::Registry,
    store::SqliteStore,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let db_pool = db::connect(&config.database_url, config.database_max_connections)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    let google = match &config.google {
        Some(settings) => Some(GoogleClient::new(settings)?),
        None => {
            warn!("GOOGLE_CLIENT_ID/SECRET/REDIRECT_URL not set, google sign-in disabled");
            None
        }
    };

    let app_state = AppState::new(
        SqliteStore::new(db_pool),
        Registry::spawn(config.registry_queue_capacity),
        google,
        config.connection.clone(),
    );

    let listener = tokio::net::TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("binding {}", config.server_addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app(app_state, config.session_ttl_minutes)).await?;
    Ok(())
}
