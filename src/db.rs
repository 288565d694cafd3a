use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use tracing::info;

use crate::message::GENERAL_ROOM_ID;

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        email TEXT UNIQUE,
        google_id TEXT UNIQUE,
        password_hash TEXT,
        avatar_url TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS rooms (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT,
        creator_id TEXT REFERENCES users(id),
        pair_key TEXT UNIQUE,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS room_members (
        room_id TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        PRIMARY KEY (room_id, user_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_room_members_user ON room_members(user_id)",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        room_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        username TEXT NOT NULL,
        content TEXT NOT NULL,
        kind TEXT NOT NULL DEFAULT 'message',
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_room_created ON messages(room_id, created_at DESC)",
];

/// Opens the pool and migrates it. In-memory databases need
/// `max_connections == 1`, since every connection gets its own copy.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let db_pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    migrate(&db_pool).await?;
    info!(database_url, "database ready");
    Ok(db_pool)
}

/// Applies the schema and seeds the general room. Safe to run repeatedly.
pub async fn migrate(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for query in MIGRATIONS {
        sqlx::query(query).execute(db_pool).await?;
    }

    sqlx::query("INSERT OR IGNORE INTO rooms (id,kind,name,created_at) VALUES (?,'general','General',0)")
        .bind(GENERAL_ROOM_ID.to_string())
        .execute(db_pool)
        .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory() -> SqlitePool {
    connect("sqlite::memory:", 1).await.unwrap()
}
