mod room;
mod new;
mod ws;

use axum::{Router, http::StatusCode, routing::{get, post}};
use uuid::Uuid;

use crate::{AppResult, AppState, store::{Room, RoomDirectory, SqliteStore}};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::room_ws))
        .route("/api/messages", get(room::general_history))
        .route("/api/room/messages", get(room::room_history))
        .route("/api/room/online", get(room::online))
        .route("/api/room/private", post(new::private_room))
        .route("/api/group/create", post(new::group))
        .route("/api/groups", get(room::groups))
        .route("/api/group/members", get(room::group_members))
}

/// Loads a room the user is allowed into: 404 if it does not exist, 403 if
/// it is private or a group they are not part of.
pub(crate) async fn accessible_room(db: &SqliteStore, room_id: Uuid, user_id: Option<Uuid>) -> AppResult<Room> {
    let Some(room) = db.get_room(room_id).await? else {
        return Err((StatusCode::NOT_FOUND, format!("room {room_id} does not exist")).into());
    };

    match user_id {
        _ if room.kind == crate::store::RoomKind::General => Ok(room),
        Some(user_id) if room.admits(user_id) => Ok(room),
        Some(_) => Err((StatusCode::FORBIDDEN, "not a member of this room").into()),
        None => Err((StatusCode::UNAUTHORIZED, "not signed in").into()),
    }
}
