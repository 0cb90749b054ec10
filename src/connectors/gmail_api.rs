use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::auth::CredentialProvider;
use crate::connectors::{
    ChangePage, ChangeRecord, LabelChange, MailTransport, MessageRef, Profile, RawMessage,
    RemoteLabel, TransportError,
};
use crate::db::models::LabelKind;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const MAX_LIST_PAGE_SIZE: usize = 500;
const HISTORY_PAGE_SIZE: usize = 100;
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const REDACTED_BODY_MAX_LEN: usize = 200;

/// Gmail v1 REST API as a [`MailTransport`].
pub struct GmailApiConnector {
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
    base_url: String,
}

impl GmailApiConnector {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::with_base_url(credentials, GMAIL_API_BASE)
    }

    pub fn with_base_url(credentials: Arc<dyn CredentialProvider>, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            credentials,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<String, TransportError> {
        let token = self.credentials.current_credential().await?;
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self
                .client
                .get(url)
                .bearer_auth(&token)
                .header("accept", "application/json")
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RATE_LIMIT_RETRIES {
                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                warn!("gmail rate limited, retrying in {retry_after_seconds}s");
                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            let body = response.text().await?;
            return match status {
                status if status.is_success() => Ok(body),
                StatusCode::NOT_FOUND => Err(TransportError::NotFound(url.to_string())),
                StatusCode::GONE => Err(TransportError::Gone(url.to_string())),
                status => Err(TransportError::Status {
                    status,
                    body: redact_response_body(&body),
                }),
            };
        }

        Err(TransportError::Status {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: "gmail api request exhausted retries".to_string(),
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, TransportError> {
        let body = self.fetch_with_retry(url).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl MailTransport for GmailApiConnector {
    async fn list_labels(&self) -> Result<Vec<RemoteLabel>, TransportError> {
        let url = format!("{}/users/me/labels", self.base_url);
        let list: GmailLabelList = self.get_json(&url).await?;
        Ok(list.labels.into_iter().map(RemoteLabel::from).collect())
    }

    async fn list_recent_message_ids(
        &self,
        limit: usize,
    ) -> Result<Vec<MessageRef>, TransportError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while ids.len() < limit {
            let page_size = (limit - ids.len()).min(MAX_LIST_PAGE_SIZE);
            let mut url = format!(
                "{}/users/me/messages?maxResults={page_size}",
                self.base_url
            );
            if let Some(token) = page_token.as_deref() {
                url.push_str(&format!("&pageToken={token}"));
            }

            let list: GmailMessageList = self.get_json(&url).await?;
            ids.extend(list.messages.unwrap_or_default().into_iter().map(MessageRef::from));

            match list.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        ids.truncate(limit);
        debug!("listed {} recent message ids", ids.len());
        Ok(ids)
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage, TransportError> {
        let url = format!("{}/users/me/messages/{id}?format=raw", self.base_url);
        let message: GmailRawMessage = self.get_json(&url).await?;
        Ok(message.into())
    }

    async fn get_profile(&self) -> Result<Profile, TransportError> {
        let url = format!("{}/users/me/profile", self.base_url);
        let profile: GmailProfile = self.get_json(&url).await?;
        Ok(Profile {
            email_address: profile.email_address,
            cursor: profile.history_id,
        })
    }

    async fn list_changes_since(
        &self,
        cursor: &str,
        page_token: Option<&str>,
    ) -> Result<ChangePage, TransportError> {
        let mut url = format!(
            "{}/users/me/history?startHistoryId={cursor}&maxResults={HISTORY_PAGE_SIZE}",
            self.base_url
        );
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={token}"));
        }

        let list: GmailHistoryList = self.get_json(&url).await?;
        Ok(list.into())
    }
}

pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }

    let mut end = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated {} bytes]", &trimmed[..end], trimmed.len())
}

#[derive(Debug, Clone, Deserialize)]
struct GmailLabelList {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
    #[serde(rename = "type")]
    label_type: Option<String>,
}

impl From<GmailLabel> for RemoteLabel {
    fn from(label: GmailLabel) -> Self {
        let kind = label
            .label_type
            .as_deref()
            .and_then(|raw| raw.parse::<LabelKind>().ok())
            .unwrap_or_else(|| LabelKind::infer_from_id(&label.id));
        Self {
            id: label.id,
            name: label.name,
            kind,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GmailProfile {
    #[serde(rename = "emailAddress")]
    email_address: String,
    #[serde(rename = "historyId")]
    history_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageList {
    messages: Option<Vec<GmailMessageStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageStub {
    id: String,
    #[serde(rename = "threadId", default)]
    thread_id: String,
}

impl From<GmailMessageStub> for MessageRef {
    fn from(stub: GmailMessageStub) -> Self {
        Self {
            id: stub.id,
            thread_id: stub.thread_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GmailRawMessage {
    id: String,
    #[serde(rename = "threadId", default)]
    thread_id: String,
    #[serde(rename = "labelIds")]
    label_ids: Option<Vec<String>>,
    snippet: Option<String>,
    raw: Option<String>,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
}

impl From<GmailRawMessage> for RawMessage {
    fn from(message: GmailRawMessage) -> Self {
        Self {
            internal_date: message
                .internal_date
                .as_deref()
                .and_then(|raw| raw.trim().parse::<i64>().ok()),
            id: message.id,
            thread_id: message.thread_id,
            raw: message.raw,
            snippet: message.snippet,
            label_ids: message.label_ids.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHistoryList {
    history: Option<Vec<GmailHistoryRecord>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "historyId")]
    history_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHistoryRecord {
    #[serde(rename = "messagesAdded", default)]
    messages_added: Vec<GmailHistoryMessage>,
    #[serde(rename = "messagesDeleted", default)]
    messages_deleted: Vec<GmailHistoryMessage>,
    #[serde(rename = "labelsAdded", default)]
    labels_added: Vec<GmailHistoryLabelEvent>,
    #[serde(rename = "labelsRemoved", default)]
    labels_removed: Vec<GmailHistoryLabelEvent>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHistoryMessage {
    message: GmailMessageStub,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHistoryLabelEvent {
    message: GmailMessageStub,
    #[serde(rename = "labelIds", default)]
    label_ids: Vec<String>,
}

impl From<GmailHistoryLabelEvent> for LabelChange {
    fn from(event: GmailHistoryLabelEvent) -> Self {
        Self {
            message: event.message.into(),
            label_ids: event.label_ids,
        }
    }
}

impl From<GmailHistoryRecord> for ChangeRecord {
    fn from(record: GmailHistoryRecord) -> Self {
        Self {
            messages_added: record
                .messages_added
                .into_iter()
                .map(|added| added.message.into())
                .collect(),
            messages_deleted: record
                .messages_deleted
                .into_iter()
                .map(|deleted| deleted.message.into())
                .collect(),
            labels_added: record.labels_added.into_iter().map(Into::into).collect(),
            labels_removed: record.labels_removed.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<GmailHistoryList> for ChangePage {
    fn from(list: GmailHistoryList) -> Self {
        Self {
            records: list
                .history
                .unwrap_or_default()
                .into_iter()
                .map(ChangeRecord::from)
                .collect(),
            new_cursor: list.history_id,
            next_page_token: list.next_page_token.filter(|token| !token.is_empty()),
        }
    }
}
