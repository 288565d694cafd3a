use axum::{
    Json, Router, debug_handler,
    extract::{Query, State},
    response::Redirect,
    routing::{get, post},
};
use rand::seq::IndexedRandom;
use serde::Deserialize;
use tower_sessions::Session;
use tracing::info;

use crate::{AppResult, AppState, session, store::{User, UserDirectory}};

mod clients;
mod login;
mod lockin;
mod password;

pub use clients::{GoogleClient, GoogleSettings};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/register", post(login::register))
        .route("/api/login", post(login::login))
        .route("/api/guest", post(login::guest))
        .route("/api/me", get(me))
        .route("/auth/google", get(login::google_login))
        .route("/auth/google/callback", get(lockin::lockin))
        .route("/logout", get(logout))
}

#[debug_handler(state = AppState)]
async fn me(State(state): State<AppState>, session: Session) -> AppResult<Json<User>> {
    let identity = session::identity(&session).await?;
    let user = state
        .db
        .get_user(identity.user_id)
        .await?
        .ok_or((axum::http::StatusCode::UNAUTHORIZED, "user no longer exists"))?;
    Ok(Json(user))
}

#[derive(Deserialize)]
struct ReturnTo {
    return_url: Option<String>,
}

/// Only same-site paths are followed after sign-out.
#[debug_handler]
async fn logout(session: Session, Query(ReturnTo { return_url }): Query<ReturnTo>) -> AppResult<Redirect> {
    if let Some(user_id) = session.get::<uuid::Uuid>(session::USER_ID).await? {
        info!(%user_id, "signed out");
    }
    session.flush().await?;

    let target = return_url.filter(|url| url.starts_with('/') && !url.starts_with("//"));
    Ok(Redirect::to(target.as_deref().unwrap_or("/")))
}

/// Name for someone who signs in without picking one.
pub(crate) fn random_alias() -> String {
    let adjectives = [
        "Quick", "Lazy", "Mysterious", "Jolly", "Brave", "Silent", "Witty", "Fierce",
        "Clever", "Gentle", "Wild", "Calm", "Bold", "Shy", "Proud", "Happy", "Sad",
        "Eager", "Fancy", "Rusty", "Golden", "Silver", "Bright", "Dark", "Lucky",
    ];

    let nouns = [
        "Fox", "Bear", "Eagle", "Wolf", "Dragon", "Tiger", "Lion", "Owl", "Rabbit",
        "Falcon", "Hawk", "Shark", "Panda", "Kitten", "Puppy", "Phoenix", "Griffin",
        "Unicorn", "Turtle", "Dolphin", "Whale", "Elephant", "Giraffe", "Zebra",
    ];

    let mut rng = rand::rng();
    let adjective = adjectives.choose(&mut rng).copied().unwrap_or("Nameless");
    let noun = nouns.choose(&mut rng).copied().unwrap_or("User");
    format!("{adjective}{noun}{}", rand::random_range(10..100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_are_single_words() {
        let alias = random_alias();
        assert!(!alias.contains(' '));
        assert!(alias.len() > 4);
    }
}
