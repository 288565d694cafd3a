use axum::http::StatusCode;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{AppResult, connection::Identity};

pub const USER_ID: &str = "user_id";
pub const USERNAME: &str = "username";
pub const CSRF_STATE: &str = "csrf_state";
pub const PKCE_VERIFIER: &str = "pkce_verifier";
pub const RETURN_URL: &str = "return_url";

pub(crate) async fn sign_in(session: &Session, user_id: Uuid, username: &str) -> AppResult<()> {
    session.cycle_id().await?;
    session.insert(USER_ID, user_id).await?;
    session.insert(USERNAME, username).await?;
    Ok(())
}

/// The signed-in identity, or 401.
pub(crate) async fn identity(session: &Session) -> AppResult<Identity> {
    let user_id = session.get::<Uuid>(USER_ID).await?;
    let username = session.get::<String>(USERNAME).await?;
    match (user_id, username) {
        (Some(user_id), Some(display_name)) => Ok(Identity { user_id, display_name }),
        _ => Err((StatusCode::UNAUTHORIZED, "not signed in").into()),
    }
}
