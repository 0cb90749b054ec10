use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

/// Label id Gmail attaches to messages that have not been read.
pub const UNREAD_LABEL: &str = "UNREAD";

/// Prefix Gmail uses for ids of labels created by the user.
const USER_LABEL_PREFIX: &str = "Label_";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LabelKind {
    System,
    User,
}

impl LabelKind {
    /// Best guess for a label only known by id, before label sync names it.
    pub fn infer_from_id(label_id: &str) -> Self {
        if label_id.starts_with(USER_LABEL_PREFIX) {
            Self::User
        } else {
            Self::System
        }
    }
}

impl Display for LabelKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
        }
    }
}

impl FromStr for LabelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            other => Err(format!("invalid label type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Label {
    pub id: String,
    pub name: String,
    pub kind: LabelKind,
}

impl Label {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: LabelKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
        }
    }

    /// Stand-in row for a label referenced before label sync has seen it.
    pub fn placeholder(id: &str) -> Self {
        Self::new(id, id, LabelKind::infer_from_id(id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub sender: String,
    pub recipient_to: Option<String>,
    pub recipient_cc: Option<String>,
    pub recipient_bcc: Option<String>,
    pub snippet: String,
    pub body: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub has_attachments: bool,
    pub label_ids: Vec<String>,
}

impl Message {
    pub fn has_label(&self, label_id: &str) -> bool {
        self.label_ids.iter().any(|id| id == label_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub email: String,
    pub name: Option<String>,
    pub interaction_count: i64,
    pub last_interaction: DateTime<Utc>,
}

/// One sighting of an address in a message header, aggregated into a [`Contact`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactObservation {
    pub email: String,
    pub name: Option<String>,
    pub seen_at: DateTime<Utc>,
}

/// Fixed-width RFC 3339 so that text ordering in SQL matches time ordering.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|value| value.with_timezone(&Utc))
}

fn conversion_error(raw: &str, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        raw.len(),
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn timestamp_column(row: &Row<'_>, column: &str) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    parse_timestamp(&raw).map_err(|e| conversion_error(&raw, format!("{column}: {e}")))
}

impl Label {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let kind_raw: String = row.get("label_type")?;
        let kind = LabelKind::from_str(&kind_raw).map_err(|e| conversion_error(&kind_raw, e))?;

        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            kind,
        })
    }
}

impl Message {
    /// Label ids live in `message_labels`; callers fill `label_ids` separately.
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            thread_id: row.get("thread_id")?,
            subject: row.get("subject")?,
            sender: row.get("sender")?,
            recipient_to: row.get("recipient_to")?,
            recipient_cc: row.get("recipient_cc")?,
            recipient_bcc: row.get("recipient_bcc")?,
            snippet: row.get("snippet")?,
            body: row.get("body")?,
            timestamp: timestamp_column(row, "timestamp")?,
            is_read: row.get("is_read")?,
            has_attachments: row.get("has_attachments")?,
            label_ids: Vec::new(),
        })
    }
}

impl Contact {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            email: row.get("email")?,
            name: row.get("name")?,
            interaction_count: row.get("interaction_count")?,
            last_interaction: timestamp_column(row, "last_interaction")?,
        })
    }
}
