use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            display_label   TEXT,
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- One append-only log per channel, addressed by (channel_id, sequence).
        -- server_ts is unix milliseconds assigned at commit.
        CREATE TABLE IF NOT EXISTS messages (
            channel_id      TEXT NOT NULL,
            sequence        INTEGER NOT NULL,
            sender_id       TEXT NOT NULL,
            receiver_id     TEXT NOT NULL,
            text            TEXT NOT NULL,
            server_ts       INTEGER NOT NULL,
            PRIMARY KEY (channel_id, sequence)
        ) WITHOUT ROWID;
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
