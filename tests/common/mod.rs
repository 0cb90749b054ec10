#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::StatusCode;
use tokio::sync::Notify;
use uuid::Uuid;

use mailmirror::connectors::{
    ChangePage, MailTransport, MessageRef, Profile, RawMessage, RemoteLabel, TransportError,
};
use mailmirror::db::models::LabelKind;

pub fn temp_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("mailmirror-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp test root");
    root
}

pub fn message_ref(id: &str) -> MessageRef {
    MessageRef {
        id: id.to_string(),
        thread_id: format!("thread-{id}"),
    }
}

pub fn raw_message(id: &str, from: &str, date: &str, labels: &[&str]) -> RawMessage {
    let mime = format!(
        "From: {from}\r\nTo: Owner <owner@example.com>\r\nSubject: Message {id}\r\nDate: {date}\r\n\r\nBody of {id}"
    );
    RawMessage {
        id: id.to_string(),
        thread_id: format!("thread-{id}"),
        raw: Some(URL_SAFE_NO_PAD.encode(mime)),
        snippet: Some(format!("Body of {id}")),
        internal_date: None,
        label_ids: labels.iter().map(|label| label.to_string()).collect(),
    }
}

/// Scripted remote mailbox.
///
/// `list_changes_since` pops scripted responses in order and returns an
/// empty page once the script runs out.
pub struct FakeTransport {
    labels: Mutex<Vec<RemoteLabel>>,
    recent: Mutex<Vec<MessageRef>>,
    messages: Mutex<HashMap<String, RawMessage>>,
    broken_messages: Mutex<HashSet<String>>,
    profile_cursor: Mutex<String>,
    pages: Mutex<VecDeque<Result<ChangePage, TransportError>>>,
    change_calls: Mutex<Vec<(String, Option<String>)>>,
    profile_calls: AtomicUsize,
    gate: Mutex<Option<Arc<Notify>>>,
    panic_on_profile: AtomicBool,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self {
            labels: Mutex::new(vec![
                RemoteLabel {
                    id: "INBOX".to_string(),
                    name: "INBOX".to_string(),
                    kind: LabelKind::System,
                },
                RemoteLabel {
                    id: "UNREAD".to_string(),
                    name: "UNREAD".to_string(),
                    kind: LabelKind::System,
                },
                RemoteLabel {
                    id: "Label_1".to_string(),
                    name: "Receipts".to_string(),
                    kind: LabelKind::User,
                },
            ]),
            recent: Mutex::new(Vec::new()),
            messages: Mutex::new(HashMap::new()),
            broken_messages: Mutex::new(HashSet::new()),
            profile_cursor: Mutex::new("100".to_string()),
            pages: Mutex::new(VecDeque::new()),
            change_calls: Mutex::new(Vec::new()),
            profile_calls: AtomicUsize::new(0),
            gate: Mutex::new(None),
            panic_on_profile: AtomicBool::new(false),
        }
    }
}

impl FakeTransport {
    /// Adds a message to the mailbox and to the recent listing.
    pub fn with_recent(&self, message: RawMessage) -> &Self {
        self.recent
            .lock()
            .expect("lock recent")
            .push(MessageRef {
                id: message.id.clone(),
                thread_id: message.thread_id.clone(),
            });
        self.put_message(message);
        self
    }

    /// Makes a message fetchable without listing it as recent.
    pub fn put_message(&self, message: RawMessage) {
        self.messages
            .lock()
            .expect("lock messages")
            .insert(message.id.clone(), message);
    }

    /// Fetching this message fails with a server error.
    pub fn break_message(&self, id: &str) {
        self.broken_messages
            .lock()
            .expect("lock broken")
            .insert(id.to_string());
    }

    pub fn set_profile_cursor(&self, cursor: &str) {
        *self.profile_cursor.lock().expect("lock cursor") = cursor.to_string();
    }

    pub fn push_page(&self, page: ChangePage) {
        self.pages.lock().expect("lock pages").push_back(Ok(page));
    }

    pub fn push_error(&self, error: TransportError) {
        self.pages.lock().expect("lock pages").push_back(Err(error));
    }

    /// Every `get_profile` call waits for a permit on `gate`.
    pub fn hold_with(&self, gate: Arc<Notify>) {
        *self.gate.lock().expect("lock gate") = Some(gate);
    }

    /// While set, `get_profile` panics.
    pub fn panic_on_profile(&self, enabled: bool) {
        self.panic_on_profile.store(enabled, Ordering::SeqCst);
    }

    pub fn change_calls(&self) -> Vec<(String, Option<String>)> {
        self.change_calls.lock().expect("lock calls").clone()
    }

    /// One per full sync.
    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn list_labels(&self) -> Result<Vec<RemoteLabel>, TransportError> {
        Ok(self.labels.lock().expect("lock labels").clone())
    }

    async fn list_recent_message_ids(
        &self,
        limit: usize,
    ) -> Result<Vec<MessageRef>, TransportError> {
        let recent = self.recent.lock().expect("lock recent");
        Ok(recent.iter().take(limit).cloned().collect())
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage, TransportError> {
        if self.broken_messages.lock().expect("lock broken").contains(id) {
            return Err(TransportError::Status {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "backend error".to_string(),
            });
        }
        self.messages
            .lock()
            .expect("lock messages")
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(id.to_string()))
    }

    async fn get_profile(&self) -> Result<Profile, TransportError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_profile.load(Ordering::SeqCst) {
            panic!("profile endpoint exploded");
        }
        let gate = self.gate.lock().expect("lock gate").clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(Profile {
            email_address: "owner@example.com".to_string(),
            cursor: self.profile_cursor.lock().expect("lock cursor").clone(),
        })
    }

    async fn list_changes_since(
        &self,
        cursor: &str,
        page_token: Option<&str>,
    ) -> Result<ChangePage, TransportError> {
        self.change_calls
            .lock()
            .expect("lock calls")
            .push((cursor.to_string(), page_token.map(str::to_string)));

        let scripted = self.pages.lock().expect("lock pages").pop_front();
        match scripted {
            Some(response) => response,
            None => Ok(ChangePage {
                records: Vec::new(),
                new_cursor: self.profile_cursor.lock().expect("lock cursor").clone(),
                next_page_token: None,
            }),
        }
    }
}
