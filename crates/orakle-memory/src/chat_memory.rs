use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use orakle_core::types::{MessageId, Role};

use crate::error::MemoryError;
use crate::types::Message;

/// Owns the message log exclusively (§3 Ownership: "Chat Memory exclusively
/// owns the message log"). Append-only: messages are never edited or
/// deleted, only appended and read (C3/C7).
pub struct ChatMemory {
    conn: Arc<Mutex<Connection>>,
}

impl ChatMemory {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn append(
        &self,
        role: Role,
        content: &str,
        tokens: u32,
        metadata: serde_json::Value,
    ) -> Result<Message, MemoryError> {
        let now = chrono::Utc::now();
        let db = self.conn.lock().unwrap();
        let meta_str = metadata.to_string();
        db.execute(
            "INSERT INTO messages (role, content, tokens, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![role.to_string(), content, tokens, now.to_rfc3339(), meta_str],
        )?;
        let id = db.last_insert_rowid();
        db.execute(
            "INSERT INTO messages_fts (rowid, content) VALUES (?1, ?2)",
            rusqlite::params![id, content],
        )?;
        Ok(Message {
            id: MessageId(id),
            role,
            content: content.to_string(),
            tokens,
            timestamp: now,
            metadata: serde_json::from_value(metadata).unwrap_or_default(),
        })
    }

    /// The full ordered conversation (oldest first). Invariant: index 0 is
    /// the single system message (§3).
    pub fn all(&self) -> Result<Vec<Message>, MemoryError> {
        let db = self.conn.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, role, content, tokens, timestamp, metadata FROM messages ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Messages strictly after `since` (an RFC3339 timestamp), oldest first.
    /// `None` returns every message (§4.4 turn ingestion: "fetches all new
    /// messages since the last processed timestamp").
    pub fn since(&self, since: Option<&str>) -> Result<Vec<Message>, MemoryError> {
        let db = self.conn.lock().unwrap();
        let rows = match since {
            Some(ts) => {
                let mut stmt = db.prepare(
                    "SELECT id, role, content, tokens, timestamp, metadata FROM messages
                     WHERE timestamp > ?1 ORDER BY id ASC",
                )?;
                let rows = stmt.query_map([ts], row_to_message)?;
                rows.filter_map(|r| r.ok()).collect()
            }
            None => {
                let mut stmt = db.prepare(
                    "SELECT id, role, content, tokens, timestamp, metadata FROM messages ORDER BY id ASC",
                )?;
                let rows = stmt.query_map([], row_to_message)?;
                rows.filter_map(|r| r.ok()).collect()
            }
        };
        Ok(rows)
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<Message>, MemoryError> {
        let db = self.conn.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, role, content, tokens, timestamp, metadata FROM messages
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_message)?;
        let mut msgs: Vec<_> = rows.filter_map(|r| r.ok()).collect();
        msgs.reverse();
        Ok(msgs)
    }

    /// Paginated retrieval (C3: "paginated ... retrieval").
    pub fn page(&self, offset: usize, limit: usize) -> Result<Vec<Message>, MemoryError> {
        let db = self.conn.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, role, content, tokens, timestamp, metadata FROM messages
             ORDER BY id ASC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit as i64, offset as i64], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Keyword retrieval (C3) via the FTS5 index.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<Message>, MemoryError> {
        let db = self.conn.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT m.id, m.role, m.content, m.tokens, m.timestamp, m.metadata
             FROM messages m
             JOIN messages_fts f ON m.id = f.rowid
             WHERE messages_fts MATCH ?1
             ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![query, limit as i64], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(1)?;
    let ts_str: String = row.get(4)?;
    let meta_str: String = row.get(5)?;
    Ok(Message {
        id: MessageId(row.get(0)?),
        role: role_str.parse().unwrap_or(Role::User),
        content: row.get(2)?,
        tokens: row.get(3)?,
        timestamp: chrono::DateTime::parse_from_rfc3339(&ts_str)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
        metadata: serde_json::from_str(&meta_str).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        Arc::new(Mutex::new(conn))
    }

    #[test]
    fn append_and_read_back_in_order() {
        let mem = ChatMemory::new(memory_conn());
        mem.append(Role::System, "you are helpful", 4, serde_json::json!({})).unwrap();
        mem.append(Role::User, "hello", 1, serde_json::json!({})).unwrap();
        mem.append(Role::Assistant, "hi there", 3, serde_json::json!({})).unwrap();

        let all = mem.all().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].role, Role::System);
        assert_eq!(all[2].content, "hi there");
    }

    #[test]
    fn since_excludes_messages_at_or_before_timestamp() {
        let mem = ChatMemory::new(memory_conn());
        let first = mem.append(Role::User, "first", 1, serde_json::json!({})).unwrap();
        mem.append(Role::Assistant, "second", 1, serde_json::json!({})).unwrap();

        let since = mem.since(Some(&first.timestamp.to_rfc3339())).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].content, "second");
    }

    #[test]
    fn search_finds_matching_keyword() {
        let mem = ChatMemory::new(memory_conn());
        mem.append(Role::User, "what is the weather in Paris", 6, serde_json::json!({})).unwrap();
        mem.append(Role::User, "tell me a joke", 4, serde_json::json!({})).unwrap();

        let found = mem.search("weather", 10).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].content.contains("weather"));
    }
}
