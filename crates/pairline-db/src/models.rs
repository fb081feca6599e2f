/// Database row types. These map directly to SQLite rows.
/// Distinct from pairline-types models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub display_label: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub channel_id: String,
    pub sequence: i64,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    pub server_ts: i64,
}
