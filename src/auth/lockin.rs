use axum::{
    debug_handler,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect},
};
use oauth2::{AuthorizationCode, CsrfToken, PkceCodeVerifier, TokenResponse};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::info;

use crate::{
    AppResult, AppState,
    session::{self, CSRF_STATE, PKCE_VERIFIER, RETURN_URL},
    store::UserDirectory,
};

use super::{
    GoogleClient,
    clients::{GoogleUserInfo, USERINFO_URL},
};

#[derive(Deserialize)]
pub struct LockinQuery {
    pub state: Option<String>,
    pub code: Option<String>,
}

/// OAuth redirect target: trades the code for a token, looks the user up
/// and binds the session.
#[debug_handler(state = AppState)]
pub(crate) async fn lockin(
    Query(LockinQuery { state, code }): Query<LockinQuery>,
    State(app): State<AppState>,
    State(google): State<Option<GoogleClient>>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let Some(google) = google else {
        return Err((StatusCode::NOT_FOUND, "Google sign-in is not configured").into());
    };
    let state = CsrfToken::new(state.ok_or((StatusCode::BAD_REQUEST, "OAuth: without state"))?);
    let code = AuthorizationCode::new(code.ok_or((StatusCode::BAD_REQUEST, "OAuth: without code"))?);

    let Some(stored_state) = session.remove::<String>(CSRF_STATE).await? else {
        return Err((StatusCode::BAD_REQUEST, "no csrf_state").into());
    };
    if state.secret().as_str() != stored_state.as_str() {
        return Err((StatusCode::BAD_REQUEST, "csrf tokens don't match").into());
    }

    let Some(pkce_verifier) = session.remove::<String>(PKCE_VERIFIER).await? else {
        return Err((StatusCode::BAD_REQUEST, "no pkce_verifier").into());
    };

    let http_client = reqwest::ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let token_result = google
        .client()
        .exchange_code(code)
        .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier))
        .request_async(&http_client)
        .await?;

    let info: GoogleUserInfo = http_client
        .get(USERINFO_URL)
        .bearer_auth(token_result.access_token().secret())
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let return_url = session
        .remove::<String>(RETURN_URL)
        .await?
        .unwrap_or_else(|| "/".to_owned());

    let user = app.db.find_or_create_from_provider(&info.into_identity()).await?;
    session::sign_in(&session, user.id, &user.username).await?;
    info!(user_id = %user.id, username = %user.username, "signed in with Google");

    Ok(Redirect::to(&return_url))
}
