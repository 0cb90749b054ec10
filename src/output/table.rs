use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::db::models::{Contact, Label, Message};
use crate::db::StoreStats;
use crate::sync::SyncOutcome;

const FROM_WIDTH: usize = 24;
const SUBJECT_WIDTH: usize = 48;
const DATE_WIDTH: usize = 12;
const LABEL_ID_WIDTH: usize = 24;
const CONTACT_WIDTH: usize = 36;

pub fn format_labels(labels: &[Label]) -> String {
    if labels.is_empty() {
        return "No labels found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<id$}  {:<6}  Name\n",
        "ID",
        "Type",
        id = LABEL_ID_WIDTH
    ));
    out.push_str(&format!(
        "{}  ------  {}\n",
        "-".repeat(LABEL_ID_WIDTH),
        "-".repeat(24)
    ));
    for label in labels {
        out.push_str(&format!(
            "{:<id$}  {:<6}  {}\n",
            truncate_for_width(&label.id, LABEL_ID_WIDTH),
            label.kind.to_string(),
            label.name,
            id = LABEL_ID_WIDTH
        ));
    }
    out
}

pub fn format_messages(messages: &[Message]) -> String {
    if messages.is_empty() {
        return "No messages found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "  {:<from$}  {:<subject$}  {:<date$}\n",
        "From",
        "Subject",
        "Date",
        from = FROM_WIDTH,
        subject = SUBJECT_WIDTH,
        date = DATE_WIDTH
    ));
    out.push_str(&format!(
        "  {}  {}  {}\n",
        "-".repeat(FROM_WIDTH),
        "-".repeat(SUBJECT_WIDTH),
        "-".repeat(DATE_WIDTH)
    ));

    for message in messages {
        let marker = match (message.is_read, message.has_attachments) {
            (false, _) => '*',
            (true, true) => '@',
            (true, false) => ' ',
        };
        out.push_str(&format!(
            "{marker} {:<from$}  {:<subject$}  {:<date$}\n",
            pad_to_width(&truncate_for_width(&message.sender, FROM_WIDTH), FROM_WIDTH),
            pad_to_width(&truncate_for_width(&message.subject, SUBJECT_WIDTH), SUBJECT_WIDTH),
            relative_date(&message.timestamp),
            from = FROM_WIDTH,
            subject = SUBJECT_WIDTH,
            date = DATE_WIDTH
        ));
    }
    out
}

pub fn format_contacts(contacts: &[Contact]) -> String {
    if contacts.is_empty() {
        return "No contacts found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<width$}  Messages  Last Seen\n",
        "Contact",
        width = CONTACT_WIDTH
    ));
    out.push_str(&format!(
        "{}  --------  ------------\n",
        "-".repeat(CONTACT_WIDTH)
    ));
    for contact in contacts {
        let label = match &contact.name {
            Some(name) => format!("{name} <{}>", contact.email),
            None => contact.email.clone(),
        };

        out.push_str(&format!(
            "{}  {:>8}  {}\n",
            pad_to_width(&truncate_for_width(&label, CONTACT_WIDTH), CONTACT_WIDTH),
            contact.interaction_count,
            relative_date(&contact.last_interaction)
        ));
    }

    out
}

pub fn format_stats(stats: &StoreStats) -> String {
    let mut out = String::new();
    out.push_str("Mailbox replica\n");
    out.push_str("===============\n");
    out.push_str(&format!("Messages: {}\n", stats.total_messages));
    out.push_str(&format!("Labels:   {}\n", stats.total_labels));
    out.push_str(&format!("Contacts: {}\n", stats.total_contacts));
    out.push_str(&format!(
        "Cursor:   {}\n",
        stats.cursor.as_deref().unwrap_or("(never synced)")
    ));
    out
}

pub fn format_outcome(outcome: &SyncOutcome) -> String {
    let mut out = String::new();
    let kind = if outcome.full_resync {
        "Full sync"
    } else {
        "Incremental sync"
    };
    if outcome.cancelled {
        out.push_str(&format!("{kind} stopped early.\n"));
    } else if outcome.has_changes() {
        out.push_str(&format!("{kind} complete.\n"));
    } else {
        out.push_str("Already up to date.\n");
    }
    out.push_str(&format!("Added:          {}\n", outcome.messages_added));
    out.push_str(&format!("Removed:        {}\n", outcome.messages_removed));
    out.push_str(&format!("Label changes:  {}\n", outcome.labels_changed));

    if !outcome.errors.is_empty() {
        out.push_str(&format!("\nSkipped {} message(s):\n", outcome.errors.len()));
        for error in &outcome.errors {
            out.push_str(&format!("  {error}\n"));
        }
    }
    out
}

fn relative_date(value: &DateTime<Utc>) -> String {
    let delta = Utc::now().signed_duration_since(*value);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    value.format("%Y-%m-%d").to_string()
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}

// `{:<n}` pads by char count, which misaligns wide glyphs.
fn pad_to_width(value: &str, width: usize) -> String {
    let current = UnicodeWidthStr::width(value);
    if current >= width {
        return value.to_string();
    }
    format!("{value}{}", " ".repeat(width - current))
}
