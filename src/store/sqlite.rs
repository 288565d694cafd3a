use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::message::{Message, MessageKind, from_unix_millis, now_millis};

use super::{
    MIN_GROUP_SIZE, MessageStore, ProviderIdentity, Room, RoomDirectory, RoomKind, StoreError, User,
    UserDirectory,
};

type UserRow = (String, String, Option<String>, Option<String>);
type RoomRow = (String, String, Option<String>, Option<String>, i64);
type MessageRow = (String, String, String, String, String, i64);

#[derive(Clone)]
pub struct SqliteStore {
    db_pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        SqliteStore { db_pool }
    }

    async fn require_user(&self, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("SELECT 1 FROM users WHERE id=?")
            .bind(user_id.to_string())
            .fetch_optional(&self.db_pool)
            .await?
            .map(|_| ())
            .ok_or(StoreError::UnknownUser(user_id))
    }

    async fn load_room(&self, row: RoomRow) -> Result<Room, StoreError> {
        let (id, kind, name, creator_id, created_at) = row;
        let kind = RoomKind::parse(&kind)?;

        let members = if kind == RoomKind::General {
            Vec::new()
        } else {
            sqlx::query_as::<_, (String,)>("SELECT user_id FROM room_members WHERE room_id=? ORDER BY user_id")
                .bind(&id)
                .fetch_all(&self.db_pool)
                .await?
                .into_iter()
                .map(|(user_id,)| Uuid::parse_str(&user_id))
                .collect::<Result<_, _>>()?
        };

        Ok(Room {
            id: Uuid::parse_str(&id)?,
            kind,
            name,
            creator_id: creator_id.as_deref().map(Uuid::parse_str).transpose()?,
            members,
            created_at: timestamp(created_at)?,
        })
    }

    async fn user_by(&self, column: &str, value: &str) -> Result<Option<User>, StoreError> {
        let query = format!("SELECT id,username,email,avatar_url FROM users WHERE {column}=?");
        sqlx::query_as::<_, UserRow>(&query)
            .bind(value)
            .fetch_optional(&self.db_pool)
            .await?
            .map(user_from_row)
            .transpose()
    }

    /// Inserts a user under `base`, or `base` plus a random suffix when the
    /// name is taken.
    async fn insert_unique_user(&self, base: &str, identity: Option<&ProviderIdentity>) -> Result<User, StoreError> {
        let id = Uuid::now_v7();
        let email = identity.and_then(|i| i.email.clone());
        let avatar_url = identity.and_then(|i| i.avatar_url.clone());
        let mut candidate = base.to_owned();
        loop {
            let inserted = sqlx::query(
                "INSERT INTO users (id,username,email,google_id,avatar_url,created_at) VALUES (?,?,?,?,?,?)
                 ON CONFLICT(username) DO NOTHING",
            )
            .bind(id.to_string())
            .bind(&candidate)
            .bind(&email)
            .bind(identity.map(|i| i.provider_id.as_str()))
            .bind(&avatar_url)
            .bind(now_millis_i64())
            .execute(&self.db_pool)
            .await?
            .rows_affected();

            if inserted == 1 {
                info!(user_id = %id, username = %candidate, provider = identity.is_some(), "created user");
                return Ok(User {
                    id,
                    username: candidate,
                    email,
                    avatar_url,
                });
            }
            candidate = format!("{base}{}", rand::random_range(1000..10000));
        }
    }
}

fn user_from_row((id, username, email, avatar_url): UserRow) -> Result<User, StoreError> {
    Ok(User {
        id: Uuid::parse_str(&id)?,
        username,
        email,
        avatar_url,
    })
}

fn timestamp(millis: i64) -> Result<time::OffsetDateTime, StoreError> {
    from_unix_millis(millis).ok_or_else(|| StoreError::Corrupt(format!("timestamp {millis}")))
}

fn now_millis_i64() -> i64 {
    (now_millis().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Canonical key for an unordered pair of users.
fn pair_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, message: &Message, author_id: Uuid) -> Result<(), StoreError> {
        if !message.kind.is_persisted() {
            return Ok(());
        }

        sqlx::query("INSERT INTO messages (id,room_id,user_id,username,content,kind,created_at) VALUES (?,?,?,?,?,?,?)")
            .bind(message.id.to_string())
            .bind(message.room_id.to_string())
            .bind(author_id.to_string())
            .bind(&message.author_display_name)
            .bind(&message.content)
            .bind(message.kind.as_str())
            .bind(message.unix_millis())
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    async fn recent_by_room(&self, room_id: Uuid, limit: u32) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id,room_id,username,content,kind,created_at FROM messages
             WHERE room_id=? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(room_id.to_string())
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await?;

        let mut messages = rows
            .into_iter()
            .map(|(id, room_id, username, content, kind, created_at)| -> Result<Message, StoreError> {
                Ok(Message {
                    id: Uuid::parse_str(&id)?,
                    room_id: Uuid::parse_str(&room_id)?,
                    author_display_name: username,
                    content,
                    kind: MessageKind::parse(&kind)
                        .ok_or_else(|| StoreError::Corrupt(format!("message kind {kind}")))?,
                    timestamp: timestamp(created_at)?,
                    online_count: None,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }
}

#[async_trait]
impl RoomDirectory for SqliteStore {
    async fn get_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        let row: Option<RoomRow> =
            sqlx::query_as("SELECT id,kind,name,creator_id,created_at FROM rooms WHERE id=?")
                .bind(room_id.to_string())
                .fetch_optional(&self.db_pool)
                .await?;
        match row {
            Some(row) => Ok(Some(self.load_room(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_or_create_private_room(&self, user_a: Uuid, user_b: Uuid) -> Result<Room, StoreError> {
        if user_a == user_b {
            return Err(StoreError::InvalidPair);
        }
        self.require_user(user_a).await?;
        self.require_user(user_b).await?;

        let key = pair_key(user_a, user_b);
        let mut tx = self.db_pool.begin().await?;
        let room_id = Uuid::now_v7();
        let created = sqlx::query("INSERT INTO rooms (id,kind,pair_key,created_at) VALUES (?,'private',?,?) ON CONFLICT(pair_key) DO NOTHING")
            .bind(room_id.to_string())
            .bind(&key)
            .bind(now_millis_i64())
            .execute(&mut *tx)
            .await?
            .rows_affected()
            == 1;
        if created {
            for user_id in [user_a, user_b] {
                sqlx::query("INSERT INTO room_members (room_id,user_id) VALUES (?,?)")
                    .bind(room_id.to_string())
                    .bind(user_id.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        let row: RoomRow = sqlx::query_as("SELECT id,kind,name,creator_id,created_at FROM rooms WHERE pair_key=?")
            .bind(&key)
            .fetch_one(&self.db_pool)
            .await?;
        let room = self.load_room(row).await?;
        if created {
            info!(room_id = %room.id, %user_a, %user_b, "created private room");
        } else {
            debug!(room_id = %room.id, "reusing private room");
        }
        Ok(room)
    }

    async fn create_group(&self, name: &str, creator_id: Uuid, member_ids: &[Uuid]) -> Result<Room, StoreError> {
        let mut others: Vec<Uuid> = member_ids.iter().copied().filter(|id| *id != creator_id).collect();
        others.sort();
        others.dedup();
        if others.len() + 1 < MIN_GROUP_SIZE {
            return Err(StoreError::TooFewMembers(others.len()));
        }

        self.require_user(creator_id).await?;
        for user_id in &others {
            self.require_user(*user_id).await?;
        }

        let room_id = Uuid::now_v7();
        let mut tx = self.db_pool.begin().await?;
        sqlx::query("INSERT INTO rooms (id,kind,name,creator_id,created_at) VALUES (?,'group',?,?,?)")
            .bind(room_id.to_string())
            .bind(name)
            .bind(creator_id.to_string())
            .bind(now_millis_i64())
            .execute(&mut *tx)
            .await?;
        for user_id in std::iter::once(creator_id).chain(others) {
            sqlx::query("INSERT INTO room_members (room_id,user_id) VALUES (?,?)")
                .bind(room_id.to_string())
                .bind(user_id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(%room_id, %creator_id, name, "created group");
        self.get_room(room_id).await?.ok_or(StoreError::RoomNotFound(room_id))
    }

    async fn group_members(&self, room_id: Uuid) -> Result<Vec<User>, StoreError> {
        let room = self.get_room(room_id).await?.ok_or(StoreError::RoomNotFound(room_id))?;
        if room.kind != RoomKind::Group {
            return Err(StoreError::NotAGroup(room_id));
        }

        sqlx::query_as::<_, UserRow>(
            "SELECT u.id,u.username,u.email,u.avatar_url FROM users u
             INNER JOIN room_members rm ON rm.user_id = u.id
             WHERE rm.room_id=? ORDER BY u.username",
        )
        .bind(room_id.to_string())
        .fetch_all(&self.db_pool)
        .await?
        .into_iter()
        .map(user_from_row)
        .collect()
    }

    async fn user_groups(&self, user_id: Uuid) -> Result<Vec<Room>, StoreError> {
        let rows: Vec<RoomRow> = sqlx::query_as(
            "SELECT r.id,r.kind,r.name,r.creator_id,r.created_at FROM rooms r
             INNER JOIN room_members rm ON rm.room_id = r.id
             WHERE rm.user_id=? AND r.kind='group' ORDER BY r.created_at DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.db_pool)
        .await?;

        let mut rooms = Vec::with_capacity(rows.len());
        for row in rows {
            rooms.push(self.load_room(row).await?);
        }
        Ok(rooms)
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        self.user_by("id", &user_id.to_string()).await
    }

    async fn register(&self, username: &str, email: Option<&str>, password_hash: &str) -> Result<User, StoreError> {
        let id = Uuid::now_v7();
        let inserted = sqlx::query(
            "INSERT INTO users (id,username,email,password_hash,created_at) VALUES (?,?,?,?,?)
             ON CONFLICT DO NOTHING",
        )
        .bind(id.to_string())
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(now_millis_i64())
        .execute(&self.db_pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::AlreadyRegistered);
        }
        info!(user_id = %id, username, "registered user");
        Ok(User {
            id,
            username: username.to_owned(),
            email: email.map(str::to_owned),
            avatar_url: None,
        })
    }

    async fn credentials(&self, username: &str) -> Result<Option<(User, String)>, StoreError> {
        let row: Option<(String, String, Option<String>, Option<String>, String)> = sqlx::query_as(
            "SELECT id,username,email,avatar_url,password_hash FROM users
             WHERE username=? AND password_hash IS NOT NULL",
        )
        .bind(username)
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(|(id, username, email, avatar_url, hash)| -> Result<(User, String), StoreError> {
            Ok((user_from_row((id, username, email, avatar_url))?, hash))
        })
        .transpose()
    }

    async fn create_guest(&self, base: &str) -> Result<User, StoreError> {
        debug!(base, "creating guest");
        self.insert_unique_user(base, None).await
    }

    async fn find_or_create_from_provider(&self, identity: &ProviderIdentity) -> Result<User, StoreError> {
        if let Some(user) = self.user_by("google_id", &identity.provider_id).await? {
            return Ok(user);
        }

        if let Some(email) = &identity.email {
            if let Some(user) = self.user_by("email", email).await? {
                sqlx::query("UPDATE users SET google_id=?, avatar_url=COALESCE(avatar_url, ?) WHERE id=?")
                    .bind(&identity.provider_id)
                    .bind(&identity.avatar_url)
                    .bind(user.id.to_string())
                    .execute(&self.db_pool)
                    .await?;
                info!(user_id = %user.id, "linked identity provider account");
                return self
                    .get_user(user.id)
                    .await?
                    .ok_or(StoreError::UnknownUser(user.id));
            }
        }

        let base = identity
            .name
            .as_deref()
            .or_else(|| identity.email.as_deref().and_then(|email| email.split('@').next()))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or("user")
            .to_owned();
        self.insert_unique_user(&base, Some(identity)).await
    }

    async fn list_users_except(&self, user_id: Uuid) -> Result<Vec<User>, StoreError> {
        sqlx::query_as::<_, UserRow>("SELECT id,username,email,avatar_url FROM users WHERE id!=? ORDER BY username")
            .bind(user_id.to_string())
            .fetch_all(&self.db_pool)
            .await?
            .into_iter()
            .map(user_from_row)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::{db, message::GENERAL_ROOM_ID};

    async fn store() -> SqliteStore {
        SqliteStore::new(db::memory().await)
    }

    async fn users(store: &SqliteStore, names: &[&str]) -> Vec<Uuid> {
        let mut ids = Vec::new();
        for name in names {
            ids.push(store.create_guest(name).await.unwrap().id);
        }
        ids
    }

    #[tokio::test]
    async fn general_room_always_exists() {
        let store = store().await;
        let room = store.get_room(GENERAL_ROOM_ID).await.unwrap().unwrap();
        assert_eq!(room.kind, RoomKind::General);
        assert!(room.admits(Uuid::now_v7()));
    }

    #[tokio::test]
    async fn private_room_is_unique_per_pair() {
        let store = store().await;
        let ids = users(&store, &["u1", "u2", "u3"]).await;

        let first = store.get_or_create_private_room(ids[0], ids[1]).await.unwrap();
        let second = store.get_or_create_private_room(ids[0], ids[1]).await.unwrap();
        let reversed = store.get_or_create_private_room(ids[1], ids[0]).await.unwrap();
        let other = store.get_or_create_private_room(ids[0], ids[2]).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.id, reversed.id);
        assert_ne!(first.id, other.id);
        assert_eq!(first.kind, RoomKind::Private);
        assert!(first.admits(ids[0]) && first.admits(ids[1]) && !first.admits(ids[2]));
    }

    #[tokio::test]
    async fn private_room_rejects_bad_pairs() {
        let store = store().await;
        let ids = users(&store, &["u1"]).await;

        assert!(matches!(
            store.get_or_create_private_room(ids[0], ids[0]).await,
            Err(StoreError::InvalidPair)
        ));
        assert!(matches!(
            store.get_or_create_private_room(ids[0], Uuid::now_v7()).await,
            Err(StoreError::UnknownUser(_))
        ));
    }

    #[tokio::test]
    async fn group_needs_two_other_members() {
        let store = store().await;
        let ids = users(&store, &["creator", "a", "b"]).await;

        let err = store.create_group("tiny", ids[0], &[ids[1], ids[1], ids[0]]).await.unwrap_err();
        assert!(matches!(err, StoreError::TooFewMembers(1)));

        let group = store.create_group("crew", ids[0], &[ids[1], ids[2]]).await.unwrap();
        assert_eq!(group.kind, RoomKind::Group);
        assert_eq!(group.name.as_deref(), Some("crew"));
        assert_eq!(group.creator_id, Some(ids[0]));
        assert_eq!(group.members.len(), 3);

        let names: Vec<_> = store
            .group_members(group.id)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.username)
            .collect();
        assert_eq!(names, ["a", "b", "creator"]);

        let groups = store.user_groups(ids[2]).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, group.id);
    }

    #[tokio::test]
    async fn group_members_of_non_group_fails() {
        let store = store().await;
        assert!(matches!(
            store.group_members(GENERAL_ROOM_ID).await,
            Err(StoreError::NotAGroup(_))
        ));
        assert!(matches!(
            store.group_members(Uuid::now_v7()).await,
            Err(StoreError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn history_is_oldest_first_and_limited() {
        let store = store().await;
        let author = users(&store, &["alice"]).await[0];
        let base = now_millis();

        // Appended out of timestamp order.
        let mut appends = Vec::new();
        for offset in [3, 0, 4, 1, 2] {
            let mut msg = Message::new(GENERAL_ROOM_ID, "alice", offset.to_string(), MessageKind::Message);
            msg.timestamp = base + Duration::seconds(offset);
            appends.push(msg);
        }
        let futures = appends.iter().map(|msg| store.append(msg, author));
        for result in futures_util::future::join_all(futures).await {
            result.unwrap();
        }

        let all = store.recent_by_room(GENERAL_ROOM_ID, 50).await.unwrap();
        let contents: Vec<_> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["0", "1", "2", "3", "4"]);
        assert!(all.iter().all(|m| m.online_count.is_none()));

        let last_two = store.recent_by_room(GENERAL_ROOM_ID, 2).await.unwrap();
        let contents: Vec<_> = last_two.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["3", "4"]);

        assert!(store.recent_by_room(Uuid::now_v7(), 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn presence_counts_are_never_stored() {
        let store = store().await;
        store.append(&Message::presence(GENERAL_ROOM_ID, 4), Uuid::now_v7()).await.unwrap();
        store.append(&Message::join(GENERAL_ROOM_ID, "alice"), Uuid::now_v7()).await.unwrap();

        let history = store.recent_by_room(GENERAL_ROOM_ID, 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, MessageKind::Join);
    }

    #[tokio::test]
    async fn guests_never_reuse_an_existing_account() {
        let store = store().await;
        let first = store.create_guest("alice").await.unwrap();
        let second = store.create_guest("alice").await.unwrap();
        assert_eq!(first.username, "alice");
        assert_ne!(first.id, second.id);
        assert!(second.username.starts_with("alice") && second.username != "alice");

        assert_eq!(store.list_users_except(first.id).await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn registration_rejects_taken_names_and_emails() {
        let store = store().await;
        let user = store.register("alice", Some("a@example.com"), "$argon2id$x").await.unwrap();

        assert!(matches!(
            store.register("alice", None, "$argon2id$y").await,
            Err(StoreError::AlreadyRegistered)
        ));
        assert!(matches!(
            store.register("alicia", Some("a@example.com"), "$argon2id$y").await,
            Err(StoreError::AlreadyRegistered)
        ));

        let (found, hash) = store.credentials("alice").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(hash, "$argon2id$x");
    }

    #[tokio::test]
    async fn passwordless_accounts_have_no_credentials() {
        let store = store().await;
        store.create_guest("guest").await.unwrap();
        let identity = ProviderIdentity {
            provider_id: "g-1".into(),
            email: Some("carol@example.com".into()),
            name: Some("carol".into()),
            avatar_url: None,
        };
        store.find_or_create_from_provider(&identity).await.unwrap();

        assert!(store.credentials("guest").await.unwrap().is_none());
        assert!(store.credentials("carol").await.unwrap().is_none());
        assert!(store.credentials("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn provider_identity_links_by_email_then_reuses() {
        let store = store().await;
        let identity = ProviderIdentity {
            provider_id: "g-1".into(),
            email: Some("alice@example.com".into()),
            name: Some("alice".into()),
            avatar_url: None,
        };

        let created = store.find_or_create_from_provider(&identity).await.unwrap();
        assert_eq!(created.username, "alice");
        let again = store.find_or_create_from_provider(&identity).await.unwrap();
        assert_eq!(created.id, again.id);

        // Same display name, different account: gets a suffixed username.
        let other = ProviderIdentity {
            provider_id: "g-2".into(),
            email: Some("other@example.com".into()),
            ..identity.clone()
        };
        let second = store.find_or_create_from_provider(&other).await.unwrap();
        assert_ne!(second.id, created.id);
        assert!(second.username.starts_with("alice") && second.username != "alice");
    }
}
