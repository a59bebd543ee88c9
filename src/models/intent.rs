use std::fmt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    FetchEmails,
    Summarize,
    GenerateReply,
    SendReply,
    DeleteEmail,
    Categorize,
    Digest,
    // Fallback for anything the classifier could not place
    #[serde(other)]
    Query,
}

impl Intent {
    pub fn from_tag(tag: &str) -> Intent {
        match tag.trim().to_ascii_lowercase().as_str() {
            "fetch_emails" | "fetch" | "list" => Intent::FetchEmails,
            "summarize" => Intent::Summarize,
            "generate_reply" | "reply" => Intent::GenerateReply,
            "send_reply" | "send" => Intent::SendReply,
            "delete_email" | "delete" => Intent::DeleteEmail,
            "categorize" => Intent::Categorize,
            "digest" => Intent::Digest,
            _ => Intent::Query,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::FetchEmails => "fetch_emails",
            Intent::Summarize => "summarize",
            Intent::GenerateReply => "generate_reply",
            Intent::SendReply => "send_reply",
            Intent::DeleteEmail => "delete_email",
            Intent::Categorize => "categorize",
            Intent::Digest => "digest",
            Intent::Query => "query",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments extracted alongside an intent. `None` means the slot was not
/// given at all; `Some("")` means it was given empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slots {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<String>,
    /// Zero-based position in the most recent listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: Intent,
    #[serde(flatten)]
    pub slots: Slots,
}

impl IntentResult {
    pub fn new(intent: Intent) -> Self {
        IntentResult { intent, slots: Slots::default() }
    }

    pub fn with_slots(intent: Intent, slots: Slots) -> Self {
        IntentResult { intent, slots }
    }

    /// Lenient reading of a classifier answer. Numbers may arrive as strings
    /// and booleans as "yes"/"true"; JSON `null` counts as absent.
    pub fn from_json(value: &Value) -> IntentResult {
        let intent = value.get("intent")
            .and_then(Value::as_str)
            .map(Intent::from_tag)
            .unwrap_or(Intent::Query);

        let slots = Slots {
            count: number_slot(value, "count").and_then(|n| u32::try_from(n).ok()),
            query: string_slot(value, "query"),
            email_id: string_slot(value, "email_id"),
            email_index: number_slot(value, "email_index").and_then(|n| usize::try_from(n).ok()),
            confirmed: bool_slot(value, "confirmed"),
            reply_text: string_slot(value, "reply_text"),
            to: string_slot(value, "to"),
            subject: string_slot(value, "subject"),
            thread_id: string_slot(value, "thread_id"),
            instruction: string_slot(value, "instruction"),
        };

        IntentResult { intent, slots }
    }
}

fn string_slot(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_slot(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn bool_slot(value: &Value, key: &str) -> Option<bool> {
    match value.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
