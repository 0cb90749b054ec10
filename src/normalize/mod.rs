//! Raw transport payload to canonical [`Message`] plus contact observations.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use mailparse::{MailHeaderMap, ParsedMail};
use thiserror::Error;

use crate::connectors::RawMessage;
use crate::db::models::{ContactObservation, Message, UNREAD_LABEL};

pub mod address;

use self::address::header_addresses;

pub const DEFAULT_SUBJECT: &str = "(No Subject)";
pub const DEFAULT_SENDER: &str = "(Unknown Sender)";

const CONTACT_HEADERS: [&str; 4] = ["From", "To", "Cc", "Bcc"];

// Date header shapes without a zone, read as UTC.
const NAIVE_DATE_FORMATS: [&str; 4] = [
    "%a, %d %b %Y %H:%M:%S",
    "%d %b %Y %H:%M:%S",
    "%a, %d %b %Y %H:%M",
    "%d %b %Y %H:%M",
];

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("message {0} has no raw payload")]
    MissingRaw(String),

    #[error("message {id}: raw payload is not base64: {source}")]
    Encoding {
        id: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("message {id}: malformed MIME envelope: {source}")]
    Envelope {
        id: String,
        #[source]
        source: mailparse::MailParseError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub message: Message,
    pub contacts: Vec<ContactObservation>,
}

pub fn normalize(raw: &RawMessage) -> Result<NormalizedMessage, NormalizeError> {
    let encoded = raw
        .raw
        .as_deref()
        .ok_or_else(|| NormalizeError::MissingRaw(raw.id.clone()))?;
    let bytes = decode_raw(encoded).map_err(|source| NormalizeError::Encoding {
        id: raw.id.clone(),
        source,
    })?;
    let parsed = mailparse::parse_mail(&bytes).map_err(|source| NormalizeError::Envelope {
        id: raw.id.clone(),
        source,
    })?;

    let headers = &parsed.headers;
    let timestamp = resolve_timestamp(
        headers.get_first_value("Date").as_deref(),
        raw.internal_date,
    );

    let mut message = Message {
        id: raw.id.clone(),
        thread_id: raw.thread_id.clone(),
        subject: headers
            .get_first_value("Subject")
            .unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
        sender: headers
            .get_first_value("From")
            .unwrap_or_else(|| DEFAULT_SENDER.to_string()),
        recipient_to: headers.get_first_value("To"),
        recipient_cc: headers.get_first_value("Cc"),
        recipient_bcc: headers.get_first_value("Bcc"),
        snippet: html_entity_decode(raw.snippet.as_deref().unwrap_or_default()),
        body: Some(extract_body(&parsed)),
        timestamp,
        is_read: true,
        has_attachments: has_attachments(&parsed),
        label_ids: raw.label_ids.clone(),
    };

    message.is_read = !message.has_label(UNREAD_LABEL);

    let contacts = CONTACT_HEADERS
        .iter()
        .flat_map(|name| headers.get_all_headers(name))
        .flat_map(header_addresses)
        .map(|address| ContactObservation {
            email: address.email,
            name: address.name,
            seen_at: timestamp,
        })
        .collect();

    Ok(NormalizedMessage { message, contacts })
}

fn decode_raw(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = encoded
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();
    URL_SAFE_NO_PAD
        .decode(compact.trim_end_matches('='))
        .or_else(|_| STANDARD.decode(&compact))
}

/// Date header in UTC, else the delivery time, else the epoch.
pub fn resolve_timestamp(date_header: Option<&str>, internal_date_ms: Option<i64>) -> DateTime<Utc> {
    date_header
        .and_then(parse_date_header)
        .or_else(|| internal_date_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn parse_date_header(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    // Trailing "(UTC)" style comments.
    let without_comment = match raw.rfind('(') {
        Some(idx) if raw.ends_with(')') => raw[..idx].trim_end(),
        _ => raw,
    };

    for candidate in [raw, without_comment] {
        if let Ok(parsed) = DateTime::parse_from_rfc2822(candidate) {
            return Some(parsed.with_timezone(&Utc));
        }
    }

    NAIVE_DATE_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(without_comment, format)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

fn is_multipart(part: &ParsedMail<'_>) -> bool {
    part.ctype.mimetype.to_ascii_lowercase().starts_with("multipart/")
}

/// Depth-first, the part itself first.
fn walk<'a>(part: &'a ParsedMail<'a>, out: &mut Vec<&'a ParsedMail<'a>>) {
    out.push(part);
    for sub in &part.subparts {
        walk(sub, out);
    }
}

fn extract_body(parsed: &ParsedMail<'_>) -> String {
    if !is_multipart(parsed) {
        return decode_part(parsed);
    }

    let mut parts = Vec::new();
    walk(parsed, &mut parts);
    parts
        .into_iter()
        .find(|part| part.ctype.mimetype.eq_ignore_ascii_case("text/plain"))
        .map(decode_part)
        .unwrap_or_default()
}

fn decode_part(part: &ParsedMail<'_>) -> String {
    part.get_body().unwrap_or_else(|_| {
        part.get_body_raw()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    })
}

fn has_attachments(parsed: &ParsedMail<'_>) -> bool {
    if !is_multipart(parsed) {
        return false;
    }

    let mut parts = Vec::new();
    walk(parsed, &mut parts);
    parts.into_iter().any(|part| {
        part.get_content_disposition()
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .is_some_and(|name| !name.trim().is_empty())
    })
}

fn html_entity_decode(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE;
    use base64::Engine;
    use chrono::{TimeZone, Timelike, Utc};

    use super::{normalize, resolve_timestamp, NormalizeError, DEFAULT_SENDER, DEFAULT_SUBJECT};
    use crate::connectors::RawMessage;

    const MULTIPART_FIXTURE: &str = concat!(
        "From: Alice <alice@example.com>\r\n",
        "To: Bob <bob@example.com>, Charlie <charlie@example.com>\r\n",
        "Cc: Dana <dana@example.com>\r\n",
        "Subject: Hello World\r\n",
        "Date: Mon, 16 Feb 2026 10:00:00 +0000\r\n",
        "Content-Type: multipart/mixed; boundary=\"boundary\"\r\n",
        "\r\n",
        "--boundary\r\n",
        "Content-Type: text/plain; charset=\"utf-8\"\r\n",
        "\r\n",
        "This is the body.\r\n",
        "--boundary\r\n",
        "Content-Type: application/pdf\r\n",
        "Content-Disposition: attachment; filename=\"test.pdf\"\r\n",
        "\r\n",
        "dummy-pdf-content\r\n",
        "--boundary--"
    );

    fn raw_message(mime: &str, internal_date: Option<i64>, labels: &[&str]) -> RawMessage {
        RawMessage {
            id: "msg123".to_string(),
            thread_id: "thread123".to_string(),
            raw: Some(URL_SAFE.encode(mime.as_bytes())),
            snippet: Some("This is the body.".to_string()),
            internal_date,
            label_ids: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn multipart_message_maps_every_field() {
        let normalized = normalize(&raw_message(
            MULTIPART_FIXTURE,
            Some(1_739_699_800_000),
            &["INBOX", "UNREAD"],
        ))
        .expect("normalize");
        let message = normalized.message;

        assert_eq!(message.id, "msg123");
        assert_eq!(message.thread_id, "thread123");
        assert_eq!(message.subject, "Hello World");
        assert_eq!(message.sender, "Alice <alice@example.com>");
        assert_eq!(
            message.recipient_to.as_deref(),
            Some("Bob <bob@example.com>, Charlie <charlie@example.com>")
        );
        assert_eq!(message.recipient_cc.as_deref(), Some("Dana <dana@example.com>"));
        assert!(message.recipient_bcc.is_none());
        assert_eq!(
            message.body.as_deref().map(str::trim_end),
            Some("This is the body.")
        );
        assert!(!message.is_read);
        assert!(message.has_attachments);
        assert_eq!(message.label_ids, vec!["INBOX", "UNREAD"]);
        assert_eq!(
            message.timestamp,
            Utc.with_ymd_and_hms(2026, 2, 16, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn contacts_cover_every_address_header() {
        let normalized =
            normalize(&raw_message(MULTIPART_FIXTURE, None, &["INBOX"])).expect("normalize");

        let emails: Vec<&str> = normalized
            .contacts
            .iter()
            .map(|contact| contact.email.as_str())
            .collect();
        assert_eq!(
            emails,
            vec![
                "alice@example.com",
                "bob@example.com",
                "charlie@example.com",
                "dana@example.com"
            ]
        );

        let alice = &normalized.contacts[0];
        assert_eq!(alice.name.as_deref(), Some("Alice"));
        assert_eq!(alice.seen_at, normalized.message.timestamp);
    }

    #[test]
    fn duplicate_addresses_are_kept_for_the_store_to_aggregate() {
        let mime = "From: a@example.com\r\nTo: A <A@example.com>\r\n\r\nhi";
        let normalized = normalize(&raw_message(mime, None, &[])).expect("normalize");
        assert_eq!(normalized.contacts.len(), 2);
        assert!(normalized
            .contacts
            .iter()
            .all(|contact| contact.email == "a@example.com"));
    }

    #[test]
    fn zoned_date_converts_to_utc() {
        let mime = "Date: Mon, 16 Feb 2026 10:00:00 -0500\r\n\r\n";
        let normalized = normalize(&raw_message(mime, Some(0), &[])).expect("normalize");
        assert_eq!(
            normalized.message.timestamp,
            Utc.with_ymd_and_hms(2026, 2, 16, 15, 0, 0).unwrap()
        );
    }

    #[test]
    fn naive_date_is_read_as_utc() {
        let mime = "Date: 16 Feb 2026 10:00:00\r\n\r\n";
        let normalized = normalize(&raw_message(mime, Some(0), &[])).expect("normalize");
        assert_eq!(
            normalized.message.timestamp,
            Utc.with_ymd_and_hms(2026, 2, 16, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn unparsable_date_falls_back_to_internal_date() {
        let mime = "Date: Invalid Date\r\n\r\n";
        let normalized =
            normalize(&raw_message(mime, Some(1_739_700_000_000), &[])).expect("normalize");
        let expected = Utc.timestamp_millis_opt(1_739_700_000_000).unwrap();
        assert_eq!(normalized.message.timestamp, expected);
        assert_eq!(normalized.message.timestamp.hour(), 10);
    }

    #[test]
    fn missing_date_and_internal_date_use_epoch() {
        assert_eq!(resolve_timestamp(None, None).timestamp(), 0);
        assert_eq!(
            resolve_timestamp(Some("Tue, 17 Feb 2026 08:30:00 +0100 (CET)"), None),
            Utc.with_ymd_and_hms(2026, 2, 17, 7, 30, 0).unwrap()
        );
    }

    #[test]
    fn missing_headers_get_defaults_and_single_part_body_is_decoded() {
        let mime = "Content-Type: text/plain; charset=utf-8\r\n\r\nJust text";
        let normalized = normalize(&raw_message(mime, Some(5), &["INBOX"])).expect("normalize");
        let message = normalized.message;

        assert_eq!(message.subject, DEFAULT_SUBJECT);
        assert_eq!(message.sender, DEFAULT_SENDER);
        assert_eq!(message.body.as_deref(), Some("Just text"));
        assert!(message.is_read);
        assert!(!message.has_attachments);
        assert!(normalized.contacts.is_empty());
    }

    #[test]
    fn multipart_without_plain_text_has_empty_body() {
        let mime = concat!(
            "Content-Type: multipart/alternative; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>hi</p>\r\n",
            "--b--"
        );
        let normalized = normalize(&raw_message(mime, None, &[])).expect("normalize");
        assert_eq!(normalized.message.body.as_deref(), Some(""));
        assert!(!normalized.message.has_attachments);
    }

    #[test]
    fn inline_part_with_content_type_name_counts_as_attachment() {
        let mime = concat!(
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "see image\r\n",
            "--b\r\n",
            "Content-Type: image/png; name=\"pic.png\"\r\n",
            "\r\n",
            "xyz\r\n",
            "--b--"
        );
        let normalized = normalize(&raw_message(mime, None, &[])).expect("normalize");
        assert!(normalized.message.has_attachments);
    }

    #[test]
    fn undecodable_charset_degrades_instead_of_failing() {
        let mime = "Content-Type: text/plain; charset=x-unknown-charset\r\n\r\ncaf\u{e9}";
        let normalized = normalize(&raw_message(mime, None, &[])).expect("normalize");
        assert!(normalized
            .message
            .body
            .as_deref()
            .is_some_and(|body| body.starts_with("caf")));
    }

    #[test]
    fn snippet_entities_are_decoded() {
        let mut raw = raw_message("Subject: x\r\n\r\n", None, &[]);
        raw.snippet = Some("Tom &amp; Jerry&#39;s &lt;show&gt;".to_string());
        let normalized = normalize(&raw).expect("normalize");
        assert_eq!(normalized.message.snippet, "Tom & Jerry's <show>");
    }

    #[test]
    fn missing_or_corrupt_raw_payload_is_an_error() {
        let mut raw = raw_message("Subject: x\r\n\r\n", None, &[]);
        raw.raw = None;
        assert!(matches!(normalize(&raw), Err(NormalizeError::MissingRaw(id)) if id == "msg123"));

        raw.raw = Some("!!!not base64!!!".to_string());
        assert!(matches!(
            normalize(&raw),
            Err(NormalizeError::Encoding { .. })
        ));
    }
}
