use axum::{
    Json, debug_handler,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use uuid::Uuid;

use crate::{
    AppResult, AppState,
    message::{GENERAL_ROOM_ID, Message},
    session,
    store::{Room, RoomDirectory, User},
};

use super::accessible_room;

const DEFAULT_HISTORY: u32 = 50;
const MAX_HISTORY: u32 = 500;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HistoryQuery {
    room_id: Option<Uuid>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RoomQuery {
    room_id: Option<Uuid>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OnlineCount {
    room_id: Uuid,
    online_count: usize,
}

fn history_limit(limit: Option<u32>) -> u32 {
    limit.filter(|l| *l > 0).unwrap_or(DEFAULT_HISTORY).min(MAX_HISTORY)
}

async fn history(state: &AppState, session: &Session, room_id: Uuid, limit: Option<u32>) -> AppResult<Json<Vec<Message>>> {
    let user_id = session.get::<Uuid>(session::USER_ID).await?;
    let room = accessible_room(&state.db, room_id, user_id).await?;
    Ok(Json(state.messages.recent_by_room(room.id, history_limit(limit)).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn general_history(
    State(state): State<AppState>,
    session: Session,
    Query(HistoryQuery { limit, .. }): Query<HistoryQuery>,
) -> AppResult<Json<Vec<Message>>> {
    history(&state, &session, GENERAL_ROOM_ID, limit).await
}

#[debug_handler(state = AppState)]
pub(crate) async fn room_history(
    State(state): State<AppState>,
    session: Session,
    Query(HistoryQuery { room_id, limit }): Query<HistoryQuery>,
) -> AppResult<Json<Vec<Message>>> {
    history(&state, &session, room_id.unwrap_or(GENERAL_ROOM_ID), limit).await
}

#[debug_handler(state = AppState)]
pub(crate) async fn online(
    State(state): State<AppState>,
    session: Session,
    Query(RoomQuery { room_id }): Query<RoomQuery>,
) -> AppResult<Json<OnlineCount>> {
    let user_id = session.get::<Uuid>(session::USER_ID).await?;
    let room = accessible_room(&state.db, room_id.unwrap_or(GENERAL_ROOM_ID), user_id).await?;
    Ok(Json(OnlineCount {
        room_id: room.id,
        online_count: state.registry.online_count(room.id).await,
    }))
}

#[debug_handler(state = AppState)]
pub(crate) async fn groups(State(state): State<AppState>, session: Session) -> AppResult<Json<Vec<Room>>> {
    let identity = session::identity(&session).await?;
    Ok(Json(state.db.user_groups(identity.user_id).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn group_members(
    State(state): State<AppState>,
    session: Session,
    Query(RoomQuery { room_id }): Query<RoomQuery>,
) -> AppResult<Json<Vec<User>>> {
    let identity = session::identity(&session).await?;
    let room_id = room_id.ok_or((axum::http::StatusCode::BAD_REQUEST, "roomId is required"))?;
    let room = accessible_room(&state.db, room_id, Some(identity.user_id)).await?;
    Ok(Json(state.db.group_members(room.id).await?))
}
