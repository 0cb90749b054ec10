//! Full and incremental synchronization of the local store with the remote
//! change feed.
//!
//! Remote reads happen outside store transactions; each page of changes is
//! then applied in one synchronous transaction that also advances the
//! cursor, so the stored cursor never points past a partially applied page.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connectors::{ChangePage, MailTransport, MessageRef, TransportError};
use crate::db::models::Label;
use crate::db::{Database, DbError, WriteTxn};
use crate::normalize::{normalize, NormalizedMessage};

pub mod outcome;
pub mod scheduler;

pub use outcome::SyncOutcome;
pub use scheduler::{SyncEvent, SyncScheduler};

use self::outcome::PageCounts;

pub const DEFAULT_MAX_RECENT: usize = 500;
const FULL_SYNC_BATCH_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] DbError),
}

pub struct SyncEngine<T> {
    db: Arc<Database>,
    transport: T,
    max_recent: usize,
    cancel: Arc<AtomicBool>,
}

impl<T: MailTransport> SyncEngine<T> {
    pub fn new(db: Arc<Database>, transport: T) -> Self {
        Self {
            db,
            transport,
            max_recent: DEFAULT_MAX_RECENT,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bounds how many recent messages a full sync pulls down.
    pub fn with_max_recent(mut self, max_recent: usize) -> Self {
        self.max_recent = max_recent;
        self
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Asks a running sync to stop after the page it is committing.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Incremental sync, or a full one when there is no usable cursor.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        self.incremental_sync().await
    }

    pub async fn full_sync(&self) -> Result<SyncOutcome, SyncError> {
        info!("starting full sync");
        let mut outcome = SyncOutcome::full();

        // Taken before listing so changes made during the listing replay next time.
        let profile = self.transport.get_profile().await?;

        let labels = self.transport.list_labels().await?;
        self.db.write(|tx| {
            for label in &labels {
                tx.upsert_label(&Label::new(&label.id, &label.name, label.kind))?;
            }
            Ok::<_, SyncError>(())
        })?;
        debug!("stored {} labels", labels.len());

        let refs = self
            .transport
            .list_recent_message_ids(self.max_recent)
            .await?;
        info!("full sync fetching {} messages", refs.len());

        for (batch_idx, batch) in refs.chunks(FULL_SYNC_BATCH_SIZE).enumerate() {
            if self.is_cancelled() {
                info!("full sync cancelled after {batch_idx} batches");
                outcome.cancelled = true;
                return Ok(outcome);
            }

            let fetched = self.fetch_messages(batch, &mut outcome).await?;
            let added = self.db.write(|tx| {
                let mut added = 0;
                for normalized in &fetched {
                    if apply_normalized(tx, normalized)? {
                        added += 1;
                    }
                }
                Ok::<_, SyncError>(added)
            })?;
            outcome.messages_added += added;
            debug!(
                "full sync batch {} committed: {} fetched, {} new",
                batch_idx + 1,
                fetched.len(),
                added
            );
        }

        self.db
            .write(|tx| tx.set_cursor(&profile.cursor).map_err(SyncError::from))?;
        info!(
            "full sync complete: {} new messages, cursor {}",
            outcome.messages_added, profile.cursor
        );
        Ok(outcome)
    }

    pub async fn incremental_sync(&self) -> Result<SyncOutcome, SyncError> {
        let Some(cursor) = self.db.get_cursor()? else {
            info!("no stored cursor, running full sync");
            return self.full_sync().await;
        };

        let mut outcome = SyncOutcome::default();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = match self
                .transport
                .list_changes_since(&cursor, page_token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(error) if error.is_cursor_invalid() => {
                    warn!("cursor {cursor} rejected ({error}), falling back to full sync");
                    let mut full = self.full_sync().await?;
                    full.merge(outcome);
                    return Ok(full);
                }
                Err(error) => return Err(error.into()),
            };

            if page.records.is_empty() {
                break;
            }

            let fetched = self.prefetch_additions(&page, &mut outcome).await?;
            let counts = self.db.write(|tx| apply_page(tx, &page, &fetched))?;
            outcome.absorb(counts);
            pages += 1;
            debug!(
                "page {pages} committed: {} records, cursor now {}",
                page.records.len(),
                page.new_cursor
            );

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }

            if self.is_cancelled() {
                info!("incremental sync cancelled after {pages} pages");
                outcome.cancelled = true;
                break;
            }
        }

        info!(
            "incremental sync: {} added, {} removed, {} label changes",
            outcome.messages_added, outcome.messages_removed, outcome.labels_changed
        );
        Ok(outcome)
    }

    /// Fetches and normalizes every added message of a page, keyed by id.
    async fn prefetch_additions(
        &self,
        page: &ChangePage,
        outcome: &mut SyncOutcome,
    ) -> Result<HashMap<String, NormalizedMessage>, SyncError> {
        let mut wanted: Vec<MessageRef> = Vec::new();
        for record in &page.records {
            for added in &record.messages_added {
                if !wanted.iter().any(|known| known.id == added.id) {
                    wanted.push(added.clone());
                }
            }
        }

        let fetched = self.fetch_messages(&wanted, outcome).await?;
        Ok(fetched
            .into_iter()
            .map(|normalized| (normalized.message.id.clone(), normalized))
            .collect())
    }

    /// Messages gone upstream are skipped; unreadable ones are skipped and
    /// recorded. Any other transport failure aborts.
    async fn fetch_messages(
        &self,
        refs: &[MessageRef],
        outcome: &mut SyncOutcome,
    ) -> Result<Vec<NormalizedMessage>, SyncError> {
        let mut fetched = Vec::with_capacity(refs.len());

        for message_ref in refs {
            let mut raw = match self.transport.get_message(&message_ref.id).await {
                Ok(raw) => raw,
                Err(error) if error.is_not_found() => {
                    warn!("message {} no longer exists upstream, skipping", message_ref.id);
                    continue;
                }
                Err(error) => return Err(error.into()),
            };
            if raw.thread_id.is_empty() {
                raw.thread_id = message_ref.thread_id.clone();
            }

            match normalize(&raw) {
                Ok(normalized) => fetched.push(normalized),
                Err(error) => {
                    warn!("skipping message {}: {error}", message_ref.id);
                    outcome.errors.push(error.to_string());
                }
            }
        }

        Ok(fetched)
    }
}

/// Stores a message, counting its contacts only the first time it is seen so
/// that replays leave the aggregates alone.
fn apply_normalized(tx: &WriteTxn<'_>, normalized: &NormalizedMessage) -> Result<bool, DbError> {
    let inserted = tx.upsert_message(&normalized.message)?;
    if inserted {
        for contact in &normalized.contacts {
            tx.upsert_contact(contact)?;
        }
    }
    Ok(inserted)
}

fn apply_page(
    tx: &WriteTxn<'_>,
    page: &ChangePage,
    fetched: &HashMap<String, NormalizedMessage>,
) -> Result<PageCounts, SyncError> {
    let mut counts = PageCounts::default();

    for record in page.records.iter().filter(|record| !record.is_empty()) {
        for added in &record.messages_added {
            if let Some(normalized) = fetched.get(&added.id) {
                if apply_normalized(tx, normalized)? {
                    counts.added += 1;
                }
            }
        }

        for change in &record.labels_added {
            tx.set_membership(&change.message.id, &change.label_ids, &[])?;
            counts.labels_changed += 1;
        }

        for change in &record.labels_removed {
            tx.set_membership(&change.message.id, &[], &change.label_ids)?;
            counts.labels_changed += 1;
        }

        for deleted in &record.messages_deleted {
            if tx.delete_message(&deleted.id)? {
                counts.removed += 1;
            }
        }
    }

    tx.set_cursor(&page.new_cursor)?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use uuid::Uuid;

    use super::apply_page;
    use crate::connectors::{ChangePage, ChangeRecord, LabelChange, MessageRef, RawMessage};
    use crate::db::Database;
    use crate::normalize::normalize;

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("mailmirror-sync-{}.db", Uuid::new_v4()))
    }

    fn message_ref(id: &str) -> MessageRef {
        MessageRef {
            id: id.to_string(),
            thread_id: format!("t-{id}"),
        }
    }

    fn raw(id: &str, from: &str) -> RawMessage {
        let mime = format!(
            "From: {from}\r\nSubject: {id}\r\nDate: Mon, 16 Feb 2026 10:00:00 +0000\r\n\r\nbody"
        );
        RawMessage {
            id: id.to_string(),
            thread_id: format!("t-{id}"),
            raw: Some(URL_SAFE_NO_PAD.encode(mime)),
            snippet: None,
            internal_date: None,
            label_ids: vec!["INBOX".to_string(), "UNREAD".to_string()],
        }
    }

    #[test]
    fn applying_a_page_twice_is_idempotent() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        let page = ChangePage {
            records: vec![ChangeRecord {
                messages_added: vec![message_ref("m1")],
                labels_removed: vec![LabelChange {
                    message: message_ref("m1"),
                    label_ids: vec!["UNREAD".to_string()],
                }],
                ..ChangeRecord::default()
            }],
            new_cursor: "42".to_string(),
            next_page_token: None,
        };
        let fetched: HashMap<_, _> = [(
            "m1".to_string(),
            normalize(&raw("m1", "Ann <ann@example.com>")).expect("normalize"),
        )]
        .into_iter()
        .collect();

        let first = db
            .write(|tx| apply_page(tx, &page, &fetched))
            .expect("first apply");
        let second = db
            .write(|tx| apply_page(tx, &page, &fetched))
            .expect("second apply");

        assert_eq!(first.added, 1);
        assert_eq!(second.added, 0);
        assert_eq!(db.message_label_ids("m1").expect("labels"), vec!["INBOX"]);
        let contact = db
            .get_contact("ann@example.com")
            .expect("contact")
            .expect("ann exists");
        assert_eq!(contact.interaction_count, 1);
        assert_eq!(db.get_cursor().expect("cursor").as_deref(), Some("42"));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn deleting_an_absent_message_counts_nothing() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        let page = ChangePage {
            records: vec![ChangeRecord {
                messages_deleted: vec![message_ref("ghost")],
                ..ChangeRecord::default()
            }],
            new_cursor: "7".to_string(),
            next_page_token: None,
        };
        let counts = db
            .write(|tx| apply_page(tx, &page, &HashMap::new()))
            .expect("apply");
        assert_eq!(counts.removed, 0);
        assert_eq!(db.get_cursor().expect("cursor").as_deref(), Some("7"));

        let _ = std::fs::remove_file(path);
    }
}
