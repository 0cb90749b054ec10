use anyhow::Result;
use rusqlite::Connection;

/// Key/value rows: the sync cursor and the schema version.
pub fn create_metadata_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    )?;
    Ok(())
}

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            thread_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            sender TEXT NOT NULL,
            recipient_to TEXT,
            recipient_cc TEXT,
            recipient_bcc TEXT,
            snippet TEXT NOT NULL DEFAULT '',
            body TEXT,
            timestamp TEXT NOT NULL,
            is_read BOOLEAN NOT NULL DEFAULT false,
            has_attachments BOOLEAN NOT NULL DEFAULT false
        );

        CREATE TABLE IF NOT EXISTS labels (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            label_type TEXT NOT NULL CHECK(label_type IN ('system', 'user'))
        );

        CREATE TABLE IF NOT EXISTS message_labels (
            message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            label_id TEXT NOT NULL REFERENCES labels(id) ON DELETE CASCADE,
            PRIMARY KEY (message_id, label_id)
        );

        CREATE TABLE IF NOT EXISTS contacts (
            email TEXT PRIMARY KEY,
            name TEXT,
            interaction_count INTEGER NOT NULL DEFAULT 1,
            last_interaction TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_thread_id ON messages(thread_id);
        CREATE INDEX IF NOT EXISTS idx_message_labels_label_id ON message_labels(label_id);
        CREATE INDEX IF NOT EXISTS idx_contacts_ranking
            ON contacts(interaction_count DESC, last_interaction DESC);
        "#,
    )?;

    Ok(())
}
