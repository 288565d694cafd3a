use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use super::{ConnectionId, Member};

/// Room id -> admitted connections. Only ever touched from the registry loop.
#[derive(Default)]
pub(crate) struct RoomIndex {
    rooms: HashMap<Uuid, HashMap<ConnectionId, Member>>,
}

impl RoomIndex {
    /// Returns false if the connection was already admitted to this room.
    pub(crate) fn insert(&mut self, member: Member) -> bool {
        let room = self.rooms.entry(member.room_id).or_default();
        if room.contains_key(&member.conn_id) {
            return false;
        }
        room.insert(member.conn_id, member);
        true
    }

    pub(crate) fn remove(&mut self, room_id: Uuid, conn_id: ConnectionId) -> Option<Member> {
        let room = self.rooms.get_mut(&room_id)?;
        let member = room.remove(&conn_id);
        if room.is_empty() {
            self.rooms.remove(&room_id);
        }
        member
    }

    pub(crate) fn count(&self, room_id: Uuid) -> usize {
        self.rooms.get(&room_id).map_or(0, HashMap::len)
    }

    pub(crate) fn members(&self, room_id: Uuid) -> impl Iterator<Item = &Member> {
        self.rooms.get(&room_id).into_iter().flat_map(HashMap::values)
    }

    pub(crate) fn online_users(&self) -> HashSet<Uuid> {
        self.rooms
            .values()
            .flat_map(HashMap::values)
            .map(|member| member.user_id)
            .collect()
    }

    pub(crate) fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn member(room_id: Uuid) -> (Member, mpsc::Receiver<std::sync::Arc<crate::message::Message>>) {
        let (tx, rx) = mpsc::channel(4);
        (Member::new(ConnectionId::new(), Uuid::now_v7(), room_id, tx), rx)
    }

    #[test]
    fn duplicate_admission_is_ignored() {
        let mut index = RoomIndex::default();
        let room = Uuid::now_v7();
        let (a, _rx) = member(room);
        let again = Member::new(a.conn_id, a.user_id, room, a.mailbox.clone());

        assert!(index.insert(a));
        assert!(!index.insert(again));
        assert_eq!(index.count(room), 1);
    }

    #[test]
    fn empty_rooms_are_pruned() {
        let mut index = RoomIndex::default();
        let room = Uuid::now_v7();
        let (a, _rx) = member(room);
        let id = a.conn_id;
        index.insert(a);

        assert!(index.remove(room, id).is_some());
        assert!(index.remove(room, id).is_none());
        assert_eq!(index.count(room), 0);
        assert_eq!(index.room_count(), 0);
    }

    #[test]
    fn rooms_are_partitioned() {
        let mut index = RoomIndex::default();
        let (r1, r2) = (Uuid::now_v7(), Uuid::now_v7());
        let (a, _ra) = member(r1);
        let (b, _rb) = member(r2);
        let (c, _rc) = member(r2);
        let users = [a.user_id, b.user_id, c.user_id];
        index.insert(a);
        index.insert(b);
        index.insert(c);

        assert_eq!(index.count(r1), 1);
        assert_eq!(index.count(r2), 2);
        assert!(index.members(r2).all(|m| m.room_id == r2));
        assert_eq!(index.online_users(), users.into_iter().collect());
    }
}
