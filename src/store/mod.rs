//! Persistence collaborators. The hub never touches these; connections only
//! see [`MessageStore`].

mod sqlite;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::message::Message;

pub use sqlite::SqliteStore;

/// Smallest number of members a group may be created with, creator included.
pub const MIN_GROUP_SIZE: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored id is not a uuid: {0}")]
    InvalidId(#[from] uuid::Error),
    #[error("stored value is invalid: {0}")]
    Corrupt(String),
    #[error("room {0} does not exist")]
    RoomNotFound(Uuid),
    #[error("room {0} is not a group")]
    NotAGroup(Uuid),
    #[error("a group needs at least 2 other members, got {0}")]
    TooFewMembers(usize),
    #[error("a private room needs two distinct users")]
    InvalidPair,
    #[error("user {0} does not exist")]
    UnknownUser(Uuid),
    #[error("username or email is already registered")]
    AlreadyRegistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    General,
    Private,
    Group,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::General => "general",
            RoomKind::Private => "private",
            RoomKind::Group => "group",
        }
    }

    pub fn parse(kind: &str) -> Result<Self, StoreError> {
        match kind {
            "general" => Ok(RoomKind::General),
            "private" => Ok(RoomKind::Private),
            "group" => Ok(RoomKind::Group),
            other => Err(StoreError::Corrupt(format!("room kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: Uuid,
    pub kind: RoomKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<Uuid>,
    /// Empty for the general room, which is open to everyone.
    pub members: Vec<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// What an identity provider tells us about a signed-in user.
#[derive(Debug, Clone)]
pub struct ProviderIdentity {
    pub provider_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: &Message, author_id: Uuid) -> Result<(), StoreError>;

    /// The last `limit` messages of a room, oldest first.
    async fn recent_by_room(&self, room_id: Uuid, limit: u32) -> Result<Vec<Message>, StoreError>;
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn get_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError>;

    async fn get_or_create_private_room(&self, user_a: Uuid, user_b: Uuid) -> Result<Room, StoreError>;

    async fn create_group(&self, name: &str, creator_id: Uuid, member_ids: &[Uuid]) -> Result<Room, StoreError>;

    async fn group_members(&self, room_id: Uuid) -> Result<Vec<User>, StoreError>;

    async fn user_groups(&self, user_id: Uuid) -> Result<Vec<Room>, StoreError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;

    /// Creates a password account. Fails with [`StoreError::AlreadyRegistered`]
    /// if the username or email is in use.
    async fn register(&self, username: &str, email: Option<&str>, password_hash: &str) -> Result<User, StoreError>;

    /// The user with this username and their password hash. `None` for unknown
    /// names and for accounts without a password (guests, provider sign-ins).
    async fn credentials(&self, username: &str) -> Result<Option<(User, String)>, StoreError>;

    /// Always a new account: `base` if free, otherwise `base` plus a suffix.
    async fn create_guest(&self, base: &str) -> Result<User, StoreError>;

    async fn find_or_create_from_provider(&self, identity: &ProviderIdentity) -> Result<User, StoreError>;

    async fn list_users_except(&self, user_id: Uuid) -> Result<Vec<User>, StoreError>;
}

impl Room {
    /// Whether `user_id` may read and join this room.
    pub fn admits(&self, user_id: Uuid) -> bool {
        self.kind == RoomKind::General || self.members.contains(&user_id)
    }
}
