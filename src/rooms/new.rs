use axum::{Json, debug_handler, extract::State, http::StatusCode};
use serde::Deserialize;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{AppResult, AppState, session, store::{Room, RoomDirectory}};

const MAX_GROUP_NAME_LEN: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PrivateRoomRequest {
    other_user_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewGroupRequest {
    name: String,
    #[serde(default)]
    member_ids: Vec<Uuid>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn private_room(
    State(state): State<AppState>,
    session: Session,

    Json(PrivateRoomRequest { other_user_id }): Json<PrivateRoomRequest>,
) -> AppResult<Json<Room>> {
    let identity = session::identity(&session).await?;
    let room = state
        .db
        .get_or_create_private_room(identity.user_id, other_user_id)
        .await?;
    Ok(Json(room))
}

#[debug_handler(state = AppState)]
pub(crate) async fn group(
    State(state): State<AppState>,
    session: Session,

    Json(NewGroupRequest { name, member_ids }): Json<NewGroupRequest>,
) -> AppResult<Json<Room>> {
    let identity = session::identity(&session).await?;
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_GROUP_NAME_LEN {
        return Err((StatusCode::BAD_REQUEST, "group name must be 1-100 characters").into());
    }

    let room = state.db.create_group(name, identity.user_id, &member_ids).await?;
    Ok(Json(room))
}
