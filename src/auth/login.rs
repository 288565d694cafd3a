use axum::{
    Json, debug_handler,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use oauth2::{CsrfToken, PkceCodeChallenge, Scope};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::{info, warn};

use crate::{
    AppError, AppResult, AppState,
    session::{self, CSRF_STATE, PKCE_VERIFIER, RETURN_URL},
    store::UserDirectory,
};

use super::{
    GoogleClient,
    clients::SCOPES,
    password::{MIN_PASSWORD_LEN, hash_password, verify_password},
    random_alias,
};

const MAX_USERNAME_LEN: usize = 50;

#[derive(Deserialize)]
pub(crate) struct LoginQuery {
    pub(crate) return_url: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct Registration {
    username: String,
    email: Option<String>,
    password: String,
}

#[derive(Deserialize)]
pub(crate) struct Credentials {
    username: String,
    password: String,
}

#[derive(Deserialize)]
pub(crate) struct GuestLogin {
    #[serde(default)]
    username: String,
}

fn valid_username(username: &str) -> AppResult<&str> {
    let username = username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN {
        return Err((StatusCode::BAD_REQUEST, "username must be 1-50 characters").into());
    }
    Ok(username)
}

#[debug_handler(state = AppState)]
pub(crate) async fn register(
    State(state): State<AppState>,
    session: Session,
    Json(Registration { username, email, password }): Json<Registration>,
) -> AppResult<Response> {
    let username = valid_username(&username)?.to_owned();
    let email = email.map(|e| e.trim().to_owned()).filter(|e| !e.is_empty());
    if email.as_deref().is_some_and(|e| !e.contains('@')) {
        return Err((StatusCode::BAD_REQUEST, "email is invalid").into());
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err((StatusCode::BAD_REQUEST, "password must be at least 6 characters").into());
    }

    let hash = tokio::task::spawn_blocking(move || hash_password(&password)).await??;
    let user = state.db.register(&username, email.as_deref(), &hash).await?;
    session::sign_in(&session, user.id, &user.username).await?;

    Ok((StatusCode::CREATED, Json(user)).into_response())
}

/// Password sign-in. Unknown names, passwordless accounts and wrong
/// passwords all get the same 401.
#[debug_handler(state = AppState)]
pub(crate) async fn login(
    State(state): State<AppState>,
    session: Session,
    Json(Credentials { username, password }): Json<Credentials>,
) -> AppResult<Response> {
    let rejected = || AppError::from((StatusCode::UNAUTHORIZED, "invalid credentials"));

    let Some((user, hash)) = state.db.credentials(username.trim()).await? else {
        return Err(rejected());
    };
    if !tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await?? {
        warn!(user_id = %user.id, "wrong password");
        return Err(rejected());
    }

    session::sign_in(&session, user.id, &user.username).await?;
    info!(user_id = %user.id, username = %user.username, "signed in");
    Ok(Json(user).into_response())
}

/// Signs in as a brand new passwordless user. The name is only a base and
/// gets a suffix if it is taken; a blank one becomes a random alias.
#[debug_handler(state = AppState)]
pub(crate) async fn guest(
    State(state): State<AppState>,
    session: Session,
    Json(GuestLogin { username }): Json<GuestLogin>,
) -> AppResult<Response> {
    let base = match username.trim() {
        "" => random_alias(),
        _ => valid_username(&username)?.to_owned(),
    };

    let user = state.db.create_guest(&base).await?;
    session::sign_in(&session, user.id, &user.username).await?;
    info!(user_id = %user.id, username = %user.username, "signed in as guest");

    Ok(Json(user).into_response())
}

#[debug_handler(state = AppState)]
pub(crate) async fn google_login(
    Query(LoginQuery { return_url }): Query<LoginQuery>,
    State(google): State<Option<GoogleClient>>,
    session: Session,
) -> AppResult<Response> {
    let Some(google) = google else {
        return Err((StatusCode::NOT_FOUND, "Google sign-in is not configured").into());
    };

    let (pkce_code_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

    let (authorize_url, csrf_state) = google
        .client()
        .authorize_url(CsrfToken::new_random)
        .add_scopes(SCOPES.iter().map(|scope| Scope::new((*scope).to_owned())))
        .set_pkce_challenge(pkce_code_challenge)
        .url();

    session.insert(CSRF_STATE, csrf_state.secret()).await?;
    session.insert(PKCE_VERIFIER, pkce_verifier.secret()).await?;
    if let Some(return_url) = return_url.filter(|url| url.starts_with('/') && !url.starts_with("//")) {
        session.insert(RETURN_URL, return_url).await?;
    }

    Ok(Redirect::to(authorize_url.as_str()).into_response())
}
