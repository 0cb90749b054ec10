pub mod json;
pub mod table;

use anyhow::Result;

use crate::db::models::{Contact, Label, Message};
use crate::db::StoreStats;
use crate::sync::SyncOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

pub fn format_labels(format: OutputFormat, labels: &[Label]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_labels(labels)),
        OutputFormat::Json => json::to_pretty(labels),
    }
}

pub fn format_messages(format: OutputFormat, messages: &[Message]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_messages(messages)),
        OutputFormat::Json => json::to_pretty(messages),
    }
}

pub fn format_contacts(format: OutputFormat, contacts: &[Contact]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_contacts(contacts)),
        OutputFormat::Json => json::to_pretty(contacts),
    }
}

pub fn format_stats(format: OutputFormat, stats: &StoreStats) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_stats(stats)),
        OutputFormat::Json => json::to_pretty(stats),
    }
}

pub fn format_outcome(format: OutputFormat, outcome: &SyncOutcome) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_outcome(outcome)),
        OutputFormat::Json => json::format_outcome(outcome),
    }
}
