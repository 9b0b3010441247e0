use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;

use crate::attachments::sanitize_filename;
use crate::models::OutboundAttachment;

const LINE_WIDTH: usize = 76;

/// Builds an RFC 2822 message (`multipart/mixed` with a text part and one
/// base64 part per attachment) and returns it base64url-encoded for
/// `messages.send`.
pub fn compose_raw(
    to: &str,
    subject: &str,
    body: &str,
    attachments: &[OutboundAttachment],
    boundary: &str,
) -> String {
    URL_SAFE.encode(compose(to, subject, body, attachments, boundary))
}

pub fn compose(
    to: &str,
    subject: &str,
    body: &str,
    attachments: &[OutboundAttachment],
    boundary: &str,
) -> String {
    let mut lines = vec![
        format!("To: {}", strip_line_breaks(to)),
        "From: me".to_string(),
        format!("Subject: {}", encode_header(&strip_line_breaks(subject))),
        "MIME-Version: 1.0".to_string(),
        format!("Content-Type: multipart/mixed; boundary=\"{}\"", boundary),
        String::new(),
        format!("--{}", boundary),
        "Content-Type: text/plain; charset=\"UTF-8\"".to_string(),
    ];
    if body.is_ascii() {
        lines.push("Content-Transfer-Encoding: 7bit".to_string());
        lines.push(String::new());
        lines.push(body.to_string());
    } else {
        lines.push("Content-Transfer-Encoding: base64".to_string());
        lines.push(String::new());
        lines.extend(wrap(&STANDARD.encode(body)));
    }

    for attachment in attachments {
        let filename = sanitize_filename(&attachment.filename);
        lines.push(String::new());
        lines.push(format!("--{}", boundary));
        lines.push(format!(
            "Content-Type: {}; name=\"{}\"",
            attachment.media_type, filename
        ));
        lines.push(format!(
            "Content-Disposition: attachment; filename=\"{}\"",
            filename
        ));
        lines.push("Content-Transfer-Encoding: base64".to_string());
        lines.push(String::new());
        lines.extend(wrap(&STANDARD.encode(&attachment.content)));
    }

    lines.push(String::new());
    lines.push(format!("--{}--", boundary));
    lines.join("\r\n")
}

fn strip_line_breaks(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// RFC 2047 encoded-word for non-ASCII headers.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value))
    }
}

fn wrap(encoded: &str) -> Vec<String> {
    encoded
        .as_bytes()
        .chunks(LINE_WIDTH)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}
