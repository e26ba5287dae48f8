use rusqlite::Connection;

/// Create the identity tables. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    // UNIQUE(conversation_key) is what serialises concurrent first contacts.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS leads (
            id               TEXT PRIMARY KEY NOT NULL,
            conversation_key TEXT NOT NULL,
            created_at       TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS conversations (
            id               TEXT PRIMARY KEY NOT NULL,
            lead_id          TEXT NOT NULL REFERENCES leads(id),
            conversation_key TEXT NOT NULL,
            created_at       TEXT NOT NULL,
            UNIQUE(conversation_key)
        );",
    )
}
