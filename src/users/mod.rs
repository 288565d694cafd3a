use axum::{Json, Router, debug_handler, extract::State, routing::get};
use serde::Serialize;
use tower_sessions::Session;

use crate::{AppResult, AppState, session, store::{User, UserDirectory}};

pub fn router() -> Router<AppState> {
    Router::new().route("/api/users", get(list))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UserStatus {
    #[serde(flatten)]
    user: User,
    is_online: bool,
}

/// Everyone except the caller, flagged with whether they hold any live
/// connection right now.
#[debug_handler(state = AppState)]
async fn list(State(state): State<AppState>, session: Session) -> AppResult<Json<Vec<UserStatus>>> {
    let identity = session::identity(&session).await?;
    let online = state.registry.online_users().await;

    let users = state
        .db
        .list_users_except(identity.user_id)
        .await?
        .into_iter()
        .map(|user| UserStatus {
            is_online: online.contains(&user.id),
            user,
        })
        .collect();
    Ok(Json(users))
}
