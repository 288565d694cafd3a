//! One live WebSocket session bound to a room.
//!
//! The reader runs on the upgrade task, the writer on its own task. They
//! share nothing but the mailbox, whose producer side belongs to the
//! registry: the writer stops when the registry closes it, or when a write
//! or keepalive fails. Either way both halves end up calling
//! [`Registry::remove`].

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::ws::{Message as WsMessage, WebSocket},
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, interval_at, timeout},
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    config::ConnectionSettings,
    hub::{ConnectionId, Member, Registry},
    message::{InboundFrame, Message, MessageKind},
    store::MessageStore,
};

/// Lifecycle of a connection. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Bootstrapped,
    Admitted,
    Active,
    Removing,
    Closed,
}

/// Who is on the other end, as established by the session layer.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderExit {
    PeerClosed,
    IdleTimeout,
    TransportError,
    WriterGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterExit {
    MailboxClosed,
    WriteFailed,
    WriteTimedOut,
    KeepaliveFailed,
}

pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    room_id: Uuid,
    registry: Registry,
    store: Arc<dyn MessageStore>,
    settings: ConnectionSettings,
    state: ConnectionState,
}

impl Connection {
    pub fn new(
        identity: Identity,
        room_id: Uuid,
        registry: Registry,
        store: Arc<dyn MessageStore>,
        settings: ConnectionSettings,
    ) -> Self {
        Connection {
            id: ConnectionId::new(),
            identity,
            room_id,
            registry,
            store,
            settings,
            state: ConnectionState::Bootstrapped,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn advance(&mut self, next: ConnectionState) {
        if next <= self.state {
            return;
        }
        trace!(conn_id = %self.id, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }

    /// Drives the session until either half stops, then cleans up.
    pub async fn run(mut self, socket: WebSocket) {
        // The writer drains the mailbox before the registry can fill it.
        let (mailbox, inbox) = mpsc::channel(self.settings.mailbox_capacity);
        let (sink, stream) = socket.split();
        let mut writer = tokio::spawn(write_loop(sink, inbox, self.settings.clone(), self.id));

        let member = Member::new(self.id, self.identity.user_id, self.room_id, mailbox);
        self.registry.admit(member).await;
        self.advance(ConnectionState::Admitted);

        info!(
            conn_id = %self.id,
            user_id = %self.identity.user_id,
            room_id = %self.room_id,
            "connection admitted"
        );
        self.publish(Message::join(self.room_id, &self.identity.display_name)).await;
        self.advance(ConnectionState::Active);

        let reader_exit = self.read_loop(stream, &mut writer).await;
        self.advance(ConnectionState::Removing);
        debug!(conn_id = %self.id, reason = ?reader_exit, "reader stopped");

        self.registry.remove(self.room_id, self.id).await;
        self.publish(Message::leave(self.room_id, &self.identity.display_name)).await;

        // Removal closed the mailbox, so a live writer sends its close frame
        // and exits within one write deadline.
        if reader_exit != ReaderExit::WriterGone {
            match timeout(self.settings.write_wait * 2, &mut writer).await {
                Ok(Ok(exit)) => debug!(conn_id = %self.id, reason = ?exit, "writer stopped"),
                Ok(Err(e)) => warn!(conn_id = %self.id, error = %e, "writer task failed"),
                Err(_) => {
                    warn!(conn_id = %self.id, "writer did not stop in time, aborting");
                    writer.abort();
                }
            }
        }

        self.advance(ConnectionState::Closed);
        info!(conn_id = %self.id, user_id = %self.identity.user_id, room_id = %self.room_id, "connection closed");
    }

    async fn read_loop(
        &mut self,
        mut stream: SplitStream<WebSocket>,
        writer: &mut JoinHandle<WriterExit>,
    ) -> ReaderExit {
        loop {
            // Any inbound frame, pongs included, resets the idle deadline.
            let frame = tokio::select! {
                exit = &mut *writer => {
                    debug!(conn_id = %self.id, reason = ?exit.ok(), "writer stopped first");
                    return ReaderExit::WriterGone;
                }
                frame = timeout(self.settings.pong_wait, stream.next()) => frame,
            };

            let frame = match frame {
                Err(_) => {
                    info!(conn_id = %self.id, "peer idle past deadline");
                    return ReaderExit::IdleTimeout;
                }
                Ok(None) => return ReaderExit::PeerClosed,
                Ok(Some(Err(e))) => {
                    debug!(conn_id = %self.id, error = %e, "websocket receive error");
                    return ReaderExit::TransportError;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                WsMessage::Text(text) => self.handle_frame(text.as_bytes()).await,
                WsMessage::Binary(data) => self.handle_frame(&data).await,
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                WsMessage::Close(frame) => {
                    debug!(conn_id = %self.id, reason = ?frame, "client initiated close");
                    return ReaderExit::PeerClosed;
                }
            }
        }
    }

    async fn handle_frame(&self, data: &[u8]) {
        let Some(content) = InboundFrame::parse(data) else {
            warn!(
                conn_id = %self.id,
                user_id = %self.identity.user_id,
                len = data.len(),
                "ignoring malformed frame"
            );
            return;
        };

        let message = Message::new(self.room_id, &self.identity.display_name, content, MessageKind::Message);
        self.publish(message).await;
    }

    /// Best-effort persist, then broadcast regardless of the outcome.
    async fn publish(&self, message: Message) {
        if let Err(e) = self.store.append(&message, self.identity.user_id).await {
            warn!(
                conn_id = %self.id,
                message_id = %message.id,
                kind = message.kind.as_str(),
                error = %e,
                "failed to persist message, broadcasting anyway"
            );
        }
        self.registry.broadcast(message).await;
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut inbox: mpsc::Receiver<Arc<Message>>,
    settings: ConnectionSettings,
    conn_id: ConnectionId,
) -> WriterExit {
    let mut keepalive = interval_at(Instant::now() + settings.ping_period, settings.ping_period);

    loop {
        tokio::select! {
            item = inbox.recv() => {
                let Some(message) = item else {
                    // The registry closed the mailbox.
                    let _ = timeout(settings.write_wait, sink.send(WsMessage::Close(None))).await;
                    return WriterExit::MailboxClosed;
                };
                let text = match serde_json::to_string(&*message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(%conn_id, error = %e, "failed to encode message, skipping");
                        continue;
                    }
                };
                match timeout(settings.write_wait, sink.send(WsMessage::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(%conn_id, error = %e, "write failed");
                        return WriterExit::WriteFailed;
                    }
                    Err(_) => {
                        info!(%conn_id, "write deadline exceeded");
                        return WriterExit::WriteTimedOut;
                    }
                }
            }
            _ = keepalive.tick() => {
                if !matches!(timeout(settings.write_wait, sink.send(WsMessage::Ping(Bytes::new()))).await, Ok(Ok(()))) {
                    info!(%conn_id, "keepalive probe failed");
                    return WriterExit::KeepaliveFailed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::store::StoreError;

    struct NullStore;

    #[async_trait]
    impl MessageStore for NullStore {
        async fn append(&self, _: &Message, _: Uuid) -> Result<(), StoreError> {
            Ok(())
        }

        async fn recent_by_room(&self, _: Uuid, _: u32) -> Result<Vec<Message>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn state_never_moves_backwards() {
        let identity = Identity {
            user_id: Uuid::now_v7(),
            display_name: "alice".into(),
        };
        let mut conn = Connection::new(
            identity,
            Uuid::now_v7(),
            Registry::spawn(4),
            Arc::new(NullStore),
            ConnectionSettings::default(),
        );
        assert_eq!(conn.state(), ConnectionState::Bootstrapped);

        conn.advance(ConnectionState::Active);
        conn.advance(ConnectionState::Admitted);
        assert_eq!(conn.state(), ConnectionState::Active);

        conn.advance(ConnectionState::Closed);
        conn.advance(ConnectionState::Removing);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
