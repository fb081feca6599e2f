use crate::Database;
use crate::models::{MessageRow, UserRow};
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Users --

    /// Insert or refresh a directory entry. A `None` label keeps the stored one.
    pub fn upsert_user(&self, id: &str, display_label: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, display_label) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    display_label = COALESCE(excluded.display_label, users.display_label),
                    updated_at = datetime('now')",
                rusqlite::params![id, display_label],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, id))
    }

    pub fn list_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, display_label, created_at FROM users ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        display_label: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    pub fn insert_message(&self, row: &MessageRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (channel_id, sequence, sender_id, receiver_id, text, server_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    row.channel_id,
                    row.sequence,
                    row.sender_id,
                    row.receiver_id,
                    row.text,
                    row.server_ts
                ],
            )?;
            Ok(())
        })
    }

    /// Messages with `after < sequence <= until`, ascending, at most `limit` rows.
    pub fn get_messages_between(
        &self,
        channel_id: &str,
        after: i64,
        until: i64,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages_between(conn, channel_id, after, until, limit))
    }

    /// Highest (sequence, server_ts) committed to a channel, if any.
    pub fn get_channel_tail(&self, channel_id: &str) -> Result<Option<(i64, i64)>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT sequence, server_ts FROM messages
                 WHERE channel_id = ?1
                 ORDER BY sequence DESC
                 LIMIT 1",
                [channel_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })
    }
}

fn query_user(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare("SELECT id, display_label, created_at FROM users WHERE id = ?1")?;

    let row = stmt
        .query_row([id], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                display_label: row.get(1)?,
                created_at: row.get(2)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_messages_between(
    conn: &Connection,
    channel_id: &str,
    after: i64,
    until: i64,
    limit: u32,
) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT channel_id, sequence, sender_id, receiver_id, text, server_ts
         FROM messages
         WHERE channel_id = ?1 AND sequence > ?2 AND sequence <= ?3
         ORDER BY sequence ASC
         LIMIT ?4",
    )?;

    let rows = stmt
        .query_map(rusqlite::params![channel_id, after, until, limit], |row| {
            Ok(MessageRow {
                channel_id: row.get(0)?,
                sequence: row.get(1)?,
                sender_id: row.get(2)?,
                receiver_id: row.get(3)?,
                text: row.get(4)?,
                server_ts: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
