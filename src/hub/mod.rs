//! Connection registry.
//!
//! A single task owns the [`RoomIndex`] and processes admit, remove and
//! broadcast requests one at a time from a bounded queue. Every mutation of
//! room membership happens inside that loop, so the index needs no locking
//! and all operations on a room are totally ordered.
//!
//! Delivery into a member's mailbox never waits: a full mailbox marks the
//! member as a slow consumer and it is evicted on the spot.

mod index;

use std::{collections::HashSet, fmt, sync::Arc};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::Message;
use index::RoomIndex;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub type Mailbox = mpsc::Sender<Arc<Message>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A connection as the registry sees it: who, where, and the producer side
/// of its mailbox. The registry holds the only sender, so dropping a member
/// closes its mailbox.
#[derive(Debug)]
pub struct Member {
    pub conn_id: ConnectionId,
    pub user_id: Uuid,
    pub room_id: Uuid,
    mailbox: Mailbox,
}

impl Member {
    pub fn new(conn_id: ConnectionId, user_id: Uuid, room_id: Uuid, mailbox: Mailbox) -> Self {
        Member {
            conn_id,
            user_id,
            room_id,
            mailbox,
        }
    }
}

enum Request {
    Admit(Member),
    Remove {
        room_id: Uuid,
        conn_id: ConnectionId,
    },
    Broadcast(Message),
    OnlineCount {
        room_id: Uuid,
        reply: oneshot::Sender<usize>,
    },
    OnlineUsers {
        reply: oneshot::Sender<HashSet<Uuid>>,
    },
}

/// Handle to the registry loop. Cheap to clone; the loop stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct Registry {
    requests: mpsc::Sender<Request>,
}

impl Registry {
    pub fn spawn(queue_capacity: usize) -> Self {
        let (requests, rx) = mpsc::channel(queue_capacity);
        tokio::spawn(RegistryLoop::default().run(rx));
        Registry { requests }
    }

    /// Adds the member to its room and announces the new occupancy.
    pub async fn admit(&self, member: Member) {
        self.submit(Request::Admit(member)).await;
    }

    /// Drops the connection from its room and closes its mailbox. Removing a
    /// connection that is already gone does nothing.
    pub async fn remove(&self, room_id: Uuid, conn_id: ConnectionId) {
        self.submit(Request::Remove { room_id, conn_id }).await;
    }

    /// Delivers the message to every connection in `message.room_id`.
    pub async fn broadcast(&self, message: Message) {
        self.submit(Request::Broadcast(message)).await;
    }

    pub async fn online_count(&self, room_id: Uuid) -> usize {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::OnlineCount { room_id, reply }).await;
        rx.await.unwrap_or(0)
    }

    /// Users with at least one live connection, in any room.
    pub async fn online_users(&self) -> HashSet<Uuid> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::OnlineUsers { reply }).await;
        rx.await.unwrap_or_default()
    }

    async fn submit(&self, request: Request) {
        if self.requests.send(request).await.is_err() {
            warn!("registry loop is gone, dropping request");
        }
    }
}

#[derive(Default)]
struct RegistryLoop {
    index: RoomIndex,
}

impl RegistryLoop {
    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        info!("registry started");
        while let Some(request) = requests.recv().await {
            self.handle(request);
        }
        info!(rooms = self.index.room_count(), "registry stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Admit(member) => self.admit(member),
            Request::Remove { room_id, conn_id } => self.remove(room_id, conn_id),
            Request::Broadcast(message) => self.broadcast(message),
            Request::OnlineCount { room_id, reply } => {
                let _ = reply.send(self.index.count(room_id));
            }
            Request::OnlineUsers { reply } => {
                let _ = reply.send(self.index.online_users());
            }
        }
    }

    fn admit(&mut self, member: Member) {
        let room_id = member.room_id;
        let conn_id = member.conn_id;
        if !self.index.insert(member) {
            debug!(%conn_id, %room_id, "connection already admitted");
            return;
        }
        debug!(%conn_id, %room_id, online = self.index.count(room_id), "connection admitted");
        self.announce_presence(room_id);
    }

    fn remove(&mut self, room_id: Uuid, conn_id: ConnectionId) {
        // Dropping the member drops the last mailbox sender.
        if self.index.remove(room_id, conn_id).is_none() {
            return;
        }
        debug!(%conn_id, %room_id, online = self.index.count(room_id), "connection removed");
        self.announce_presence(room_id);
    }

    fn broadcast(&mut self, message: Message) {
        let room_id = message.room_id;
        if self.fan_out(message) > 0 {
            self.announce_presence(room_id);
        }
    }

    /// Sends presence counts until a round completes without evictions.
    fn announce_presence(&mut self, room_id: Uuid) {
        loop {
            let presence = Message::presence(room_id, self.index.count(room_id));
            if self.fan_out(presence) == 0 {
                break;
            }
        }
    }

    /// Returns how many slow consumers were evicted.
    fn fan_out(&mut self, message: Message) -> usize {
        let room_id = message.room_id;
        let online = self.index.count(room_id);
        if online == 0 {
            return 0;
        }

        let stamped = Arc::new(message.with_online_count(online));
        let mut evicted = Vec::new();
        for member in self.index.members(room_id) {
            match member.mailbox.try_send(Arc::clone(&stamped)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn_id = %member.conn_id, user_id = %member.user_id, %room_id, "mailbox full, evicting slow consumer");
                    evicted.push(member.conn_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(conn_id = %member.conn_id, %room_id, "writer already gone, evicting");
                    evicted.push(member.conn_id);
                }
            }
        }

        for conn_id in &evicted {
            self.index.remove(room_id, *conn_id);
        }
        evicted.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::message::{GENERAL_ROOM_ID, MessageKind};

    type Inbox = mpsc::Receiver<Arc<Message>>;

    fn member(room_id: Uuid, capacity: usize) -> (Member, Inbox) {
        let (tx, rx) = mpsc::channel(capacity);
        (Member::new(ConnectionId::new(), Uuid::now_v7(), room_id, tx), rx)
    }

    async fn next(inbox: &mut Inbox) -> Arc<Message> {
        timeout(Duration::from_secs(1), inbox.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("mailbox closed")
    }

    fn drain(inbox: &mut Inbox) -> Vec<Arc<Message>> {
        let mut out = Vec::new();
        while let Ok(msg) = inbox.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn presence_tracks_admits_minus_removes() {
        let registry = Registry::spawn(16);
        let (a, mut inbox_a) = member(GENERAL_ROOM_ID, 16);
        let (b, _inbox_b) = member(GENERAL_ROOM_ID, 16);
        let b_id = b.conn_id;

        registry.admit(a).await;
        let first = next(&mut inbox_a).await;
        assert_eq!(first.kind, MessageKind::PresenceCount);
        assert_eq!(first.online_count, Some(1));

        registry.admit(b).await;
        assert_eq!(next(&mut inbox_a).await.online_count, Some(2));

        registry.remove(GENERAL_ROOM_ID, b_id).await;
        assert_eq!(next(&mut inbox_a).await.online_count, Some(1));
        assert_eq!(registry.online_count(GENERAL_ROOM_ID).await, 1);
    }

    #[tokio::test]
    async fn broadcast_stays_inside_its_room() {
        let registry = Registry::spawn(16);
        let other_room = Uuid::now_v7();
        let (a, mut inbox_a) = member(GENERAL_ROOM_ID, 16);
        let (b, mut inbox_b) = member(other_room, 16);
        registry.admit(a).await;
        registry.admit(b).await;

        registry
            .broadcast(Message::new(GENERAL_ROOM_ID, "alice", "hi", MessageKind::Message))
            .await;
        // Round-trip through the loop so every earlier request has been handled.
        registry.online_count(GENERAL_ROOM_ID).await;

        let seen_a = drain(&mut inbox_a);
        assert!(seen_a.iter().any(|m| m.content == "hi" && m.online_count == Some(1)));
        let seen_b = drain(&mut inbox_b);
        assert!(seen_b.iter().all(|m| m.room_id == other_room));
        assert!(seen_b.iter().all(|m| m.kind == MessageKind::PresenceCount));
    }

    #[tokio::test]
    async fn full_mailbox_gets_evicted_without_blocking_others() {
        let registry = Registry::spawn(16);
        let (slow, mut slow_inbox) = member(GENERAL_ROOM_ID, 1);
        let (fast, mut fast_inbox) = member(GENERAL_ROOM_ID, 16);

        // The slow member's only slot is taken by its own presence count.
        registry.admit(slow).await;
        registry.admit(fast).await;
        assert_eq!(registry.online_count(GENERAL_ROOM_ID).await, 1);

        let fast_seen = drain(&mut fast_inbox);
        let counts: Vec<_> = fast_seen.iter().filter_map(|m| m.online_count).collect();
        assert_eq!(counts, vec![2, 1]);

        registry
            .broadcast(Message::new(GENERAL_ROOM_ID, "bob", "still here", MessageKind::Message))
            .await;
        assert_eq!(next(&mut fast_inbox).await.content, "still here");

        // One queued item, then the closed mailbox.
        assert_eq!(slow_inbox.recv().await.map(|m| m.online_count), Some(Some(1)));
        assert!(slow_inbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn removing_twice_is_the_same_as_once() {
        let registry = Registry::spawn(16);
        let (a, mut inbox_a) = member(GENERAL_ROOM_ID, 16);
        let (b, mut inbox_b) = member(GENERAL_ROOM_ID, 16);
        let b_id = b.conn_id;
        registry.admit(a).await;
        registry.admit(b).await;

        registry.remove(GENERAL_ROOM_ID, b_id).await;
        registry.remove(GENERAL_ROOM_ID, b_id).await;
        registry.remove(Uuid::now_v7(), b_id).await;
        assert_eq!(registry.online_count(GENERAL_ROOM_ID).await, 1);

        let counts: Vec<_> = drain(&mut inbox_a).iter().filter_map(|m| m.online_count).collect();
        assert_eq!(counts, vec![1, 2, 1]);

        // Mailbox closed exactly once, after what was already queued.
        let _ = drain(&mut inbox_b);
        assert!(inbox_b.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_is_evicted_on_next_broadcast() {
        let registry = Registry::spawn(16);
        let (a, mut inbox_a) = member(GENERAL_ROOM_ID, 16);
        let (b, inbox_b) = member(GENERAL_ROOM_ID, 16);
        registry.admit(a).await;
        registry.admit(b).await;
        drop(inbox_b);

        registry
            .broadcast(Message::new(GENERAL_ROOM_ID, "alice", "anyone?", MessageKind::Message))
            .await;
        assert_eq!(registry.online_count(GENERAL_ROOM_ID).await, 1);

        let seen = drain(&mut inbox_a);
        let last = seen.last().unwrap();
        assert_eq!(last.kind, MessageKind::PresenceCount);
        assert_eq!(last.online_count, Some(1));
    }

    #[tokio::test]
    async fn mailbox_preserves_broadcast_order() {
        let registry = Registry::spawn(64);
        let (a, mut inbox_a) = member(GENERAL_ROOM_ID, 64);
        registry.admit(a).await;
        let _ = next(&mut inbox_a).await;

        for i in 0..20 {
            registry
                .broadcast(Message::new(GENERAL_ROOM_ID, "alice", i.to_string(), MessageKind::Message))
                .await;
        }
        for i in 0..20 {
            assert_eq!(next(&mut inbox_a).await.content, i.to_string());
        }
    }

    #[tokio::test]
    async fn online_users_spans_rooms() {
        let registry = Registry::spawn(16);
        let (a, _ia) = member(GENERAL_ROOM_ID, 4);
        let (b, _ib) = member(Uuid::now_v7(), 4);
        let expected: HashSet<_> = [a.user_id, b.user_id].into_iter().collect();
        registry.admit(a).await;
        registry.admit(b).await;

        assert_eq!(registry.online_users().await, expected);
    }
}
