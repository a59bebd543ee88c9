use std::fmt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::models::chat_turn::Metadata;

/// What the orchestrator actually did. Refines the intent, e.g. a
/// `delete_email` intent ends as `DeleteConfirm` until the user agrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTag {
    FetchEmails,
    GenerateReply,
    ReplyPrompt,
    SendReply,
    SendCancelled,
    DeleteConfirm,
    DeleteEmail,
    DeletePrompt,
    DeleteCancelled,
    Categorize,
    Digest,
    Query,
    NotFound,
}

impl ActionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTag::FetchEmails => "fetch_emails",
            ActionTag::GenerateReply => "generate_reply",
            ActionTag::ReplyPrompt => "reply_prompt",
            ActionTag::SendReply => "send_reply",
            ActionTag::SendCancelled => "send_cancelled",
            ActionTag::DeleteConfirm => "delete_confirm",
            ActionTag::DeleteEmail => "delete_email",
            ActionTag::DeletePrompt => "delete_prompt",
            ActionTag::DeleteCancelled => "delete_cancelled",
            ActionTag::Categorize => "categorize",
            ActionTag::Digest => "digest",
            ActionTag::Query => "query",
            ActionTag::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The response of one chat turn, returned to the caller and persisted as
/// the assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub message: String,
    pub action_taken: Option<ActionTag>,
    pub metadata: Option<Metadata>,
}

impl OrchestrationResult {
    pub fn text(message: impl Into<String>, action: ActionTag) -> Self {
        OrchestrationResult {
            message: message.into(),
            action_taken: Some(action),
            metadata: None,
        }
    }

    /// Builds a result whose metadata carries the action tag under `action`,
    /// which is how later turns find pending confirmations.
    pub fn with_metadata(message: impl Into<String>, action: ActionTag, mut metadata: Metadata) -> Self {
        metadata.insert("action".to_string(), Value::String(action.as_str().to_string()));
        OrchestrationResult {
            message: message.into(),
            action_taken: Some(action),
            metadata: Some(metadata),
        }
    }
}
