use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use self::models::{
    format_timestamp, Contact, ContactObservation, Label, Message, UNREAD_LABEL,
};

pub mod migrations;
pub mod models;
pub mod schema;

const CURSOR_KEY: &str = "history_id";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("writer connection lock poisoned")]
    Poisoned,

    #[error("{0}")]
    Config(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_messages: i64,
    pub total_labels: i64,
    pub total_contacts: i64,
    pub cursor: Option<String>,
}

/// Local replica of the mailbox.
///
/// One writer connection guarded by a mutex serves every [`WriteTxn`]; each
/// read opens a fresh read-only connection, so with WAL enabled readers see
/// the last committed transaction and never wait on an open writer.
pub struct Database {
    writer: Mutex<Connection>,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        migrations::migrate(&conn).map_err(|e| DbError::Config(format!("migration failed: {e}")))?;

        Ok(Self {
            writer: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let data = dirs::data_dir()
            .ok_or_else(|| DbError::Config("failed to determine data directory".to_string()))?;
        Ok(data.join("mailmirror").join("mailmirror.db"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reader(&self) -> Result<Connection, DbError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.writer.lock().map_err(|_| DbError::Poisoned)
    }

    /// Runs `apply` inside one write transaction.
    ///
    /// Everything `apply` writes through the [`WriteTxn`] commits together
    /// when it returns `Ok`; on `Err` the transaction is rolled back and the
    /// error is handed back to the caller as is.
    pub fn write<T, E, F>(&self, apply: F) -> Result<T, E>
    where
        F: FnOnce(&WriteTxn<'_>) -> Result<T, E>,
        E: From<DbError> + std::fmt::Display,
    {
        let mut conn = self.lock_writer()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DbError::from)?;

        match apply(&WriteTxn { tx: &tx }) {
            Ok(value) => {
                tx.commit().map_err(DbError::from)?;
                Ok(value)
            }
            Err(err) => {
                error!("store transaction failed, rolling back: {err}");
                Err(err)
            }
        }
    }

    pub fn get_cursor(&self) -> Result<Option<String>, DbError> {
        let conn = self.reader()?;
        read_cursor(&conn)
    }

    /// Labels with system labels first, then by name.
    pub fn list_labels(&self) -> Result<Vec<Label>, DbError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, label_type
            FROM labels
            ORDER BY CASE label_type WHEN 'system' THEN 0 ELSE 1 END, name ASC
            "#,
        )?;

        let labels = stmt
            .query_map([], Label::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(labels)
    }

    /// Newest first page of messages carrying `label_id`.
    pub fn list_by_label(
        &self,
        label_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, DbError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT m.id, m.thread_id, m.subject, m.sender, m.recipient_to, m.recipient_cc,
                   m.recipient_bcc, m.snippet, m.body, m.timestamp, m.is_read, m.has_attachments
            FROM messages m
            JOIN message_labels ml ON ml.message_id = m.id
            WHERE ml.label_id = ?1
            ORDER BY m.timestamp DESC, m.id ASC
            LIMIT ?2 OFFSET ?3
            "#,
        )?;

        let mut messages = stmt
            .query_map(
                params![label_id, limit as i64, offset as i64],
                Message::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for message in &mut messages {
            message.label_ids = load_label_ids(&conn, &message.id)?;
        }
        Ok(messages)
    }

    /// Contacts ranked by interaction count, most recent first on ties.
    pub fn top_contacts(&self, limit: usize) -> Result<Vec<Contact>, DbError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT email, name, interaction_count, last_interaction
            FROM contacts
            ORDER BY interaction_count DESC, last_interaction DESC
            LIMIT ?1
            "#,
        )?;

        let contacts = stmt
            .query_map([limit as i64], Contact::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(contacts)
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>, DbError> {
        let conn = self.reader()?;
        let message = conn
            .query_row(
                r#"
                SELECT id, thread_id, subject, sender, recipient_to, recipient_cc,
                       recipient_bcc, snippet, body, timestamp, is_read, has_attachments
                FROM messages
                WHERE id = ?1
                "#,
                [id],
                Message::from_row,
            )
            .optional()?;

        match message {
            Some(mut message) => {
                message.label_ids = load_label_ids(&conn, &message.id)?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    pub fn message_label_ids(&self, message_id: &str) -> Result<Vec<String>, DbError> {
        let conn = self.reader()?;
        load_label_ids(&conn, message_id)
    }

    pub fn get_contact(&self, email: &str) -> Result<Option<Contact>, DbError> {
        let conn = self.reader()?;
        let contact = conn
            .query_row(
                "SELECT email, name, interaction_count, last_interaction FROM contacts WHERE email = ?1",
                [email.trim().to_lowercase()],
                Contact::from_row,
            )
            .optional()?;
        Ok(contact)
    }

    pub fn stats(&self) -> Result<StoreStats, DbError> {
        let conn = self.reader()?;
        let count = |table: &str| -> Result<i64, DbError> {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?)
        };

        Ok(StoreStats {
            total_messages: count("messages")?,
            total_labels: count("labels")?,
            total_contacts: count("contacts")?,
            cursor: read_cursor(&conn)?,
        })
    }
}

fn read_cursor(conn: &Connection) -> Result<Option<String>, DbError> {
    let value: Option<Option<String>> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [CURSOR_KEY],
            |row| row.get(0),
        )
        .optional()?;

    Ok(value
        .flatten()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty()))
}

fn load_label_ids(conn: &Connection, message_id: &str) -> Result<Vec<String>, DbError> {
    let mut stmt = conn.prepare_cached(
        "SELECT label_id FROM message_labels WHERE message_id = ?1 ORDER BY label_id ASC",
    )?;
    let ids = stmt
        .query_map([message_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

/// Write access to the store, only obtainable through [`Database::write`].
///
/// Every operation is idempotent: replace by id, add if absent, delete if
/// present. Re-applying a page after a crash converges on the same state.
pub struct WriteTxn<'conn> {
    tx: &'conn Transaction<'conn>,
}

impl WriteTxn<'_> {
    /// Replaces the message row and its full label set. Returns whether the
    /// message was new to the store.
    pub fn upsert_message(&self, message: &Message) -> Result<bool, DbError> {
        let existed = self.message_exists(&message.id)?;
        self.tx.execute(
            r#"
            INSERT INTO messages (
                id, thread_id, subject, sender, recipient_to, recipient_cc, recipient_bcc,
                snippet, body, timestamp, is_read, has_attachments
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                thread_id = excluded.thread_id,
                subject = excluded.subject,
                sender = excluded.sender,
                recipient_to = excluded.recipient_to,
                recipient_cc = excluded.recipient_cc,
                recipient_bcc = excluded.recipient_bcc,
                snippet = excluded.snippet,
                body = excluded.body,
                timestamp = excluded.timestamp,
                is_read = excluded.is_read,
                has_attachments = excluded.has_attachments
            "#,
            params![
                message.id,
                message.thread_id,
                message.subject,
                message.sender,
                message.recipient_to,
                message.recipient_cc,
                message.recipient_bcc,
                message.snippet,
                message.body,
                format_timestamp(&message.timestamp),
                message.is_read,
                message.has_attachments,
            ],
        )?;

        self.tx.execute(
            "DELETE FROM message_labels WHERE message_id = ?1",
            [&message.id],
        )?;
        self.add_labels(&message.id, &message.label_ids)?;
        Ok(!existed)
    }

    pub fn upsert_label(&self, label: &Label) -> Result<(), DbError> {
        self.tx.execute(
            r#"
            INSERT INTO labels (id, name, label_type)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                label_type = excluded.label_type
            "#,
            params![label.id, label.name, label.kind.to_string()],
        )?;
        Ok(())
    }

    /// Removes `removed` then adds `added` to the message's labels, keeping
    /// `is_read` in step with the `UNREAD` label.
    ///
    /// A message that is not stored locally is left alone.
    pub fn set_membership(
        &self,
        message_id: &str,
        added: &[String],
        removed: &[String],
    ) -> Result<(), DbError> {
        if !removed.is_empty() {
            let mut stmt = self.tx.prepare_cached(
                "DELETE FROM message_labels WHERE message_id = ?1 AND label_id = ?2",
            )?;
            for label_id in removed {
                stmt.execute(params![message_id, label_id])?;
            }
        }

        if !added.is_empty() && self.message_exists(message_id)? {
            self.add_labels(message_id, added)?;
        }

        if added.iter().chain(removed).any(|id| id == UNREAD_LABEL) {
            self.tx.execute(
                r#"
                UPDATE messages SET is_read = NOT EXISTS (
                    SELECT 1 FROM message_labels WHERE message_id = ?1 AND label_id = ?2
                )
                WHERE id = ?1
                "#,
                params![message_id, UNREAD_LABEL],
            )?;
        }
        Ok(())
    }

    /// Returns whether a row was removed. Memberships cascade.
    pub fn delete_message(&self, message_id: &str) -> Result<bool, DbError> {
        let deleted = self
            .tx
            .execute("DELETE FROM messages WHERE id = ?1", [message_id])?;
        Ok(deleted > 0)
    }

    /// Counts one interaction; keeps the latest non-empty name and the newest timestamp.
    pub fn upsert_contact(&self, observation: &ContactObservation) -> Result<(), DbError> {
        let email = observation.email.trim().to_lowercase();
        if email.is_empty() {
            return Ok(());
        }
        let name = observation
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty());

        self.tx.execute(
            r#"
            INSERT INTO contacts (email, name, interaction_count, last_interaction)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(email) DO UPDATE SET
                name = COALESCE(excluded.name, contacts.name),
                interaction_count = contacts.interaction_count + 1,
                last_interaction = MAX(contacts.last_interaction, excluded.last_interaction)
            "#,
            params![email, name, format_timestamp(&observation.seen_at)],
        )?;
        Ok(())
    }

    pub fn set_cursor(&self, cursor: &str) -> Result<(), DbError> {
        self.tx.execute(
            r#"
            INSERT INTO metadata (key, value, updated_at)
            VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![CURSOR_KEY, cursor],
        )?;
        Ok(())
    }

    pub fn message_exists(&self, message_id: &str) -> Result<bool, DbError> {
        let found = self
            .tx
            .query_row("SELECT 1 FROM messages WHERE id = ?1", [message_id], |_| {
                Ok(())
            })
            .optional()?;
        Ok(found.is_some())
    }

    fn add_labels(&self, message_id: &str, label_ids: &[String]) -> Result<(), DbError> {
        let mut ensure_label = self.tx.prepare_cached(
            "INSERT OR IGNORE INTO labels (id, name, label_type) VALUES (?1, ?2, ?3)",
        )?;
        let mut link = self.tx.prepare_cached(
            "INSERT OR IGNORE INTO message_labels (message_id, label_id) VALUES (?1, ?2)",
        )?;

        for label_id in label_ids {
            let placeholder = Label::placeholder(label_id);
            ensure_label.execute(params![
                placeholder.id,
                placeholder.name,
                placeholder.kind.to_string()
            ])?;
            link.execute(params![message_id, label_id])?;
        }
        Ok(())
    }
}
