use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;
use time::OffsetDateTime;

use crate::gmail::{GmailMessage, MessagePart};

pub const DEFAULT_SUBJECT: &str = "No Subject";
pub const DEFAULT_BODY: &str = "No message content available";

/// Gmail emits URL-safe base64 with or without padding depending on the field.
const GMAIL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub fn decode_base64url(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let trimmed: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    GMAIL_BASE64.decode(trimmed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPart {
    pub filename: String,
    pub media_type: String,
    pub attachment_id: Option<String>,
    /// Small attachments can arrive inline instead of behind an attachment id.
    pub inline_data: Option<String>,
}

pub fn header_value(message: &GmailMessage, header_name: &str) -> Option<String> {
    message
        .payload
        .as_ref()?
        .headers
        .as_ref()?
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(header_name))
        .map(|h| h.value.clone())
}

pub fn subject(message: &GmailMessage) -> String {
    header_value(message, "Subject")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SUBJECT.to_string())
}

/// `internalDate` is epoch milliseconds. Falls back to now when the provider
/// omits it or sends a value outside the representable range.
pub fn sent_at(message: &GmailMessage) -> OffsetDateTime {
    message
        .internal_date
        .as_deref()
        .and_then(|raw| raw.parse::<i128>().ok())
        .and_then(|millis| millis.checked_mul(1_000_000))
        .and_then(|nanos| OffsetDateTime::from_unix_timestamp_nanos(nanos).ok())
        .unwrap_or_else(OffsetDateTime::now_utc)
}

/// First plain-text part, else the first HTML part reduced to text, else a
/// placeholder. Attachment parts are never treated as body.
pub fn body_text(message: &GmailMessage) -> String {
    let Some(payload) = message.payload.as_ref() else {
        return DEFAULT_BODY.to_string();
    };

    if let Some(text) = find_text_part(payload, "text/plain") {
        return text;
    }
    if let Some(html) = find_text_part(payload, "text/html") {
        let text = html_to_text(&html);
        if !text.is_empty() {
            return text;
        }
    }

    DEFAULT_BODY.to_string()
}

fn find_text_part(part: &MessagePart, wanted: &str) -> Option<String> {
    let is_attachment = part.filename.as_deref().is_some_and(|f| !f.is_empty());
    let matches_type = part
        .mime_type
        .as_deref()
        .is_some_and(|m| m.eq_ignore_ascii_case(wanted));

    if matches_type && !is_attachment {
        let decoded = part
            .body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .and_then(|data| decode_base64url(data).ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
            .filter(|text| !text.is_empty());
        if decoded.is_some() {
            return decoded;
        }
    }

    part.parts
        .as_ref()?
        .iter()
        .find_map(|child| find_text_part(child, wanted))
}

pub fn html_to_text(html: &str) -> String {
    static BLOCKS: OnceLock<Option<Regex>> = OnceLock::new();
    static TAGS: OnceLock<Option<Regex>> = OnceLock::new();
    static SPACES: OnceLock<Option<Regex>> = OnceLock::new();

    let blocks = BLOCKS.get_or_init(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").ok());
    let tags = TAGS.get_or_init(|| Regex::new(r"<[^>]*>").ok());
    let spaces = SPACES.get_or_init(|| Regex::new(r"[ \t\r\f]+").ok());

    let mut text = html.to_string();
    if let Some(re) = blocks {
        text = re.replace_all(&text, " ").into_owned();
    }
    if let Some(re) = tags {
        text = re.replace_all(&text, " ").into_owned();
    }

    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    let text = match spaces {
        Some(re) => re.replace_all(&text, " ").into_owned(),
        None => text,
    };

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Every part with a filename and a payload, flattened across nesting.
pub fn attachment_parts(message: &GmailMessage) -> Vec<AttachmentPart> {
    let mut found = Vec::new();
    if let Some(payload) = message.payload.as_ref() {
        collect_attachments(payload, &mut found);
    }
    found
}

fn collect_attachments(part: &MessagePart, found: &mut Vec<AttachmentPart>) {
    if let Some(filename) = part.filename.as_deref().filter(|f| !f.is_empty()) {
        let attachment_id = part.body.as_ref().and_then(|b| b.attachment_id.clone());
        let inline_data = part.body.as_ref().and_then(|b| b.data.clone());

        if attachment_id.is_some() || inline_data.is_some() {
            found.push(AttachmentPart {
                filename: filename.to_string(),
                media_type: part
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                attachment_id,
                inline_data,
            });
        }
    }

    if let Some(children) = part.parts.as_ref() {
        for child in children {
            collect_attachments(child, found);
        }
    }
}
