use rusqlite::{Connection, Result};

/// Initialise all context-database tables. Safe to call on every startup
/// (idempotent) — one relational database file exists per context (§6).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_messages_table(conn)?;
    create_messages_fts_index(conn)?;
    create_user_memories_table(conn)?;
    create_memories_fts_index(conn)?;
    create_db_metadata_table(conn)?;
    Ok(())
}

fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            tokens      INTEGER NOT NULL DEFAULT 0,
            timestamp   TEXT NOT NULL,
            metadata    TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);",
    )
}

/// FTS5 index for keyword retrieval over the message log (C3). External
/// content table, synced manually on insert — messages are append-only so
/// there is no update/delete path to keep in sync.
fn create_messages_fts_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts
            USING fts5(content, content='');",
    )
}

fn create_user_memories_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_memories (
            id                  TEXT PRIMARY KEY,
            type                TEXT NOT NULL,
            topic               TEXT NOT NULL,
            text                TEXT NOT NULL,
            relevance           REAL NOT NULL DEFAULT 1.0,
            status              TEXT NOT NULL DEFAULT 'current',
            created_at          TEXT NOT NULL,
            last_updated        TEXT NOT NULL,
            source_message_ids  TEXT NOT NULL DEFAULT '[]',
            metadata            TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_memories_topic ON user_memories(topic);
        CREATE INDEX IF NOT EXISTS idx_memories_type ON user_memories(type);
        CREATE INDEX IF NOT EXISTS idx_memories_status ON user_memories(status);",
    )
}

/// FTS5 virtual table over memory text. `content=''` makes it an external
/// content table — synced manually on every write (teacher's db.rs pattern).
fn create_memories_fts_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS user_memories_fts
            USING fts5(topic, text, content='');",
    )
}

fn create_db_metadata_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS db_metadata (
            key     TEXT PRIMARY KEY,
            value   TEXT NOT NULL
        );",
    )
}

pub fn get_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM db_metadata WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    })
}

pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO db_metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, value],
    )?;
    Ok(())
}

pub fn delete_metadata(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM db_metadata WHERE key = ?1", [key])?;
    Ok(())
}
