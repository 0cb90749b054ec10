use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthError;
use crate::db::models::LabelKind;

pub mod gmail_api;

pub use gmail_api::GmailApiConnector;

#[derive(Debug, Error)]
pub enum TransportError {
    /// 404: the message, or the cursor itself, no longer exists upstream.
    #[error("remote object not found: {0}")]
    NotFound(String),

    /// 410: the cursor is too old to replay from.
    #[error("remote cursor expired: {0}")]
    Gone(String),

    #[error("remote request failed: status={status} body={body}")]
    Status { status: StatusCode, body: String },

    #[error("remote request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("decode remote response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether a change-feed listing failed because the cursor is unusable.
    pub fn is_cursor_invalid(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Gone(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLabel {
    pub id: String,
    pub name: String,
    pub kind: LabelKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: String,
}

/// A message as the transport delivers it, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    pub thread_id: String,
    /// RFC 822 source, base64url encoded.
    pub raw: Option<String>,
    pub snippet: Option<String>,
    /// Delivery time in epoch milliseconds.
    pub internal_date: Option<i64>,
    pub label_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub email_address: String,
    pub cursor: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelChange {
    pub message: MessageRef,
    pub label_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub messages_added: Vec<MessageRef>,
    pub messages_deleted: Vec<MessageRef>,
    pub labels_added: Vec<LabelChange>,
    pub labels_removed: Vec<LabelChange>,
}

impl ChangeRecord {
    pub fn is_empty(&self) -> bool {
        self.messages_added.is_empty()
            && self.messages_deleted.is_empty()
            && self.labels_added.is_empty()
            && self.labels_removed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePage {
    pub records: Vec<ChangeRecord>,
    /// Newest feed position covered by this page.
    pub new_cursor: String,
    pub next_page_token: Option<String>,
}

/// The remote mailbox as seen by the sync engine.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn list_labels(&self) -> Result<Vec<RemoteLabel>, TransportError>;

    async fn list_recent_message_ids(&self, limit: usize)
        -> Result<Vec<MessageRef>, TransportError>;

    async fn get_message(&self, id: &str) -> Result<RawMessage, TransportError>;

    async fn get_profile(&self) -> Result<Profile, TransportError>;

    async fn list_changes_since(
        &self,
        cursor: &str,
        page_token: Option<&str>,
    ) -> Result<ChangePage, TransportError>;
}
