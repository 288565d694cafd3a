use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Well-known id of the one room every authenticated user may join.
pub const GENERAL_ROOM_ID: Uuid = Uuid::from_u128(1);

/// Author shown on `join` and `leave` announcements.
pub const SYSTEM_AUTHOR: &str = "System";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Message,
    Join,
    Leave,
    /// Synthetic occupancy report, never persisted.
    PresenceCount,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Message => "message",
            MessageKind::Join => "join",
            MessageKind::Leave => "leave",
            MessageKind::PresenceCount => "presence-count",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Some(match kind {
            "message" => MessageKind::Message,
            "join" => MessageKind::Join,
            "leave" => MessageKind::Leave,
            "presence-count" => MessageKind::PresenceCount,
            _ => return None,
        })
    }

    pub fn is_persisted(&self) -> bool {
        !matches!(self, MessageKind::PresenceCount)
    }
}

/// A chat message as it travels over the wire.
///
/// `online_count` is stamped by the registry at broadcast time and left out
/// of history replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub author_display_name: String,
    pub content: String,
    pub kind: MessageKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_count: Option<usize>,
}

impl Message {
    pub fn new(room_id: Uuid, author: impl Into<String>, content: impl Into<String>, kind: MessageKind) -> Self {
        Message {
            id: Uuid::now_v7(),
            room_id,
            author_display_name: author.into(),
            content: content.into(),
            kind,
            timestamp: now_millis(),
            online_count: None,
        }
    }

    pub fn join(room_id: Uuid, display_name: &str) -> Self {
        Self::new(room_id, SYSTEM_AUTHOR, format!("{display_name} joined the room"), MessageKind::Join)
    }

    pub fn leave(room_id: Uuid, display_name: &str) -> Self {
        Self::new(room_id, SYSTEM_AUTHOR, format!("{display_name} left the room"), MessageKind::Leave)
    }

    pub fn presence(room_id: Uuid, online_count: usize) -> Self {
        let mut msg = Self::new(room_id, SYSTEM_AUTHOR, "", MessageKind::PresenceCount);
        msg.online_count = Some(online_count);
        msg
    }

    pub fn with_online_count(&self, online_count: usize) -> Self {
        Message {
            online_count: Some(online_count),
            ..self.clone()
        }
    }

    pub fn unix_millis(&self) -> i64 {
        (self.timestamp.unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// Current time truncated to whole milliseconds, the resolution messages are
/// stored at.
pub fn now_millis() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    from_unix_millis(now.unix_timestamp_nanos() as i64 / 1_000_000).unwrap_or(now)
}

pub fn from_unix_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000).ok()
}

/// What a client sends over the socket.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    pub content: String,
}

impl InboundFrame {
    /// Parses a raw frame, returning `None` for anything that is not a
    /// non-blank `{"content": ...}` object.
    pub fn parse(data: &[u8]) -> Option<String> {
        let frame: InboundFrame = serde_json::from_slice(data).ok()?;
        let content = frame.content.trim();
        if content.is_empty() {
            return None;
        }
        Some(content.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn presence_count_uses_kebab_case_and_carries_count() {
        let msg = Message::presence(GENERAL_ROOM_ID, 3);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "presence-count");
        assert_eq!(value["onlineCount"], 3);
        assert_eq!(value["roomId"], "00000000-0000-0000-0000-000000000001");
    }

    #[test]
    fn history_shape_omits_online_count() {
        let msg = Message::new(GENERAL_ROOM_ID, "alice", "hi", MessageKind::Message);
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("onlineCount").is_none());
        assert_eq!(value["authorDisplayName"], "alice");
        assert_eq!(value["content"], "hi");
    }

    #[test]
    fn stamping_online_count_keeps_identity() {
        let msg = Message::new(GENERAL_ROOM_ID, "alice", "hi", MessageKind::Message);
        let stamped = msg.with_online_count(2);
        assert_eq!(stamped.id, msg.id);
        assert_eq!(stamped.online_count, Some(2));
        assert_eq!(msg.online_count, None);
    }

    #[test]
    fn timestamps_survive_millisecond_storage() {
        let msg = Message::new(GENERAL_ROOM_ID, "alice", "hi", MessageKind::Message);
        assert_eq!(from_unix_millis(msg.unix_millis()), Some(msg.timestamp));
    }

    #[test]
    fn inbound_frames_must_carry_content() {
        assert_eq!(InboundFrame::parse(br#"{"content":" hi "}"#).as_deref(), Some("hi"));
        assert_eq!(InboundFrame::parse(br#"{"content":"   "}"#), None);
        assert_eq!(InboundFrame::parse(br#"{"text":"hi"}"#), None);
        assert_eq!(InboundFrame::parse(b"not json"), None);
        assert_eq!(InboundFrame::parse(json!({"content": 5}).to_string().as_bytes()), None);
    }

    #[test]
    fn only_presence_is_synthetic() {
        for kind in [MessageKind::Message, MessageKind::Join, MessageKind::Leave] {
            assert!(kind.is_persisted());
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert!(!MessageKind::PresenceCount.is_persisted());
    }
}
