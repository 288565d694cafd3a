use axum::{
    debug_handler,
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::debug;
use uuid::Uuid;

use crate::{AppResult, AppState, connection::Connection, message::GENERAL_ROOM_ID, session};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WsQuery {
    room_id: Option<Uuid>,
}

/// Session bootstrap: authenticate, resolve the room, upgrade, and hand
/// the socket to a new [`Connection`].
#[debug_handler(state = AppState)]
pub(crate) async fn room_ws(
    Query(WsQuery { room_id }): Query<WsQuery>,
    State(state): State<AppState>,
    session: Session,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let identity = session::identity(&session).await?;
    let room = super::accessible_room(&state.db, room_id.unwrap_or(GENERAL_ROOM_ID), Some(identity.user_id)).await?;
    debug!(user_id = %identity.user_id, room_id = %room.id, "upgrading session");

    let conn = Connection::new(
        identity,
        room.id,
        state.registry.clone(),
        state.messages.clone(),
        state.connection.clone(),
    );

    Ok(ws
        .max_message_size(state.connection.max_message_size)
        .on_upgrade(move |socket| conn.run(socket))
        .into_response())
}
