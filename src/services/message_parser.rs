use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use html2text::render::text_renderer::TrivialDecorator;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;

use crate::models::email::EmailRecord;
use crate::models::gmail_message::{Header, MessagePart, RawMessage};

pub const NO_SUBJECT: &str = "(No Subject)";
pub const UNKNOWN_SENDER: &str = "Unknown";
pub const UNKNOWN_DATE: &str = "Unknown date";

const RENDER_WIDTH: usize = 4096;

lazy_static! {
    static ref SCRIPT_OR_STYLE: Regex =
        Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>").unwrap();
    static ref INNER_WHITESPACE: Regex = Regex::new(r"[ \t\u{a0}]+").unwrap();
}

/// Turns a `format=full` payload into an [`EmailRecord`]. Never fails:
/// missing headers get placeholders and undecodable bodies become empty.
pub fn parse(message: &RawMessage) -> EmailRecord {
    let headers: &[Header] = message.payload
        .as_ref()
        .map(|p| &p.headers[..])
        .unwrap_or(&[]);

    let body = message.payload
        .as_ref()
        .map(|payload| extract_body(payload, &message.id))
        .unwrap_or_default();

    EmailRecord {
        id: message.id.clone(),
        thread_id: message.thread_id.clone().unwrap_or_default(),
        from: get_header(headers, "From").unwrap_or_else(|| UNKNOWN_SENDER.to_string()),
        to: get_header(headers, "To").unwrap_or_default(),
        subject: get_header(headers, "Subject").unwrap_or_else(|| NO_SUBJECT.to_string()),
        date: get_header(headers, "Date").unwrap_or_else(|| UNKNOWN_DATE.to_string()),
        snippet: message.snippet.clone().unwrap_or_default(),
        body,
        labels: message.label_ids.clone(),
    }
}

/// Case-insensitive header lookup.
pub fn get_header(headers: &[Header], name: &str) -> Option<String> {
    headers.iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

fn extract_body(payload: &MessagePart, message_id: &str) -> String {
    if let Some(data) = find_part_data(payload, "text/plain") {
        return normalize_whitespace(&decode_body(data, message_id));
    }
    if let Some(data) = find_part_data(payload, "text/html") {
        return html_to_text(&decode_body(data, message_id));
    }

    // Single-part message without a usable mime type.
    match payload.body.as_ref().and_then(|b| b.data.as_deref()) {
        Some(data) if payload.parts.is_empty() => normalize_whitespace(&decode_body(data, message_id)),
        _ => {
            debug!("No text body found for message {}", message_id);
            String::new()
        }
    }
}

/// Depth-first search for the first part of `mime` that carries data.
fn find_part_data<'a>(part: &'a MessagePart, mime: &str) -> Option<&'a str> {
    let is_match = part.mime_type
        .as_deref()
        .map(|m| m.eq_ignore_ascii_case(mime))
        .unwrap_or(false);
    if is_match {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
            if !data.is_empty() {
                return Some(data);
            }
        }
    }
    part.parts.iter().find_map(|child| find_part_data(child, mime))
}

/// Decodes base64url with or without padding; malformed input yields "".
pub fn decode_body(data: &str, message_id: &str) -> String {
    let trimmed = data.trim().trim_end_matches('=');
    match URL_SAFE_NO_PAD.decode(trimmed) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!("Body of message {} is not valid UTF-8: {}", message_id, e);
                String::new()
            }
        },
        Err(e) => {
            warn!("Failed to decode base64 body for message {}: {}", message_id, e);
            String::new()
        }
    }
}

/// Strips markup to plain text. Script and style content is dropped entirely.
pub fn html_to_text(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let without_scripts = SCRIPT_OR_STYLE.replace_all(html, "");
    let rendered = html2text::from_read_with_decorator(
        without_scripts.as_bytes(),
        RENDER_WIDTH,
        TrivialDecorator::new(),
    );
    normalize_whitespace(&rendered)
}

/// Trims each line, collapses inner runs of spaces and drops blank lines.
pub fn normalize_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| INNER_WHITESPACE.replace_all(line.trim(), " ").into_owned())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
