use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::Ollama;
use serde_json::Value;

use crate::config::{OllamaConfig, SYSTEM_PROMPT};
use crate::models::chat_turn::{format_turns, ChatTurn};
use crate::models::email::{format_emails, EmailRecord};
use crate::models::intent::IntentResult;

/// Category name to the ids of the emails placed in it.
pub type Categories = BTreeMap<String, Vec<String>>;

pub const FALLBACK_CATEGORY: &str = "Other";

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("Language model request failed: {0}")]
    Backend(String),

    #[error("Language model did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Language model returned an unusable answer: {0}")]
    MalformedResponse(String),
}

/// The natural-language capability: classification and text generation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Assistant: Send + Sync {
    async fn detect_intent(&self, text: &str, history: &[ChatTurn]) -> Result<IntentResult, AssistantError>;
    async fn summarize_one(&self, email: &EmailRecord) -> Result<String, AssistantError>;
    /// `instruction` is empty when the user gave none.
    async fn generate_reply(&self, email: &EmailRecord, instruction: &str) -> Result<String, AssistantError>;
    async fn categorize(&self, emails: &[EmailRecord]) -> Result<Categories, AssistantError>;
    async fn digest(&self, emails: &[EmailRecord]) -> Result<String, AssistantError>;
    async fn answer(&self, text: &str, context: &str) -> Result<String, AssistantError>;
}

/// [`Assistant`] backed by a local Ollama model.
#[derive(Clone)]
pub struct OllamaAssistant {
    ollama: Ollama,
    model: String,
    timeout: Duration,
}

impl OllamaAssistant {
    pub fn new(config: &OllamaConfig) -> Self {
        OllamaAssistant {
            ollama: Ollama::new(config.host.clone(), config.port),
            model: config.model.clone(),
            timeout: config.timeout,
        }
    }

    async fn complete(&self, system: &str, prompt: String) -> Result<String, AssistantError> {
        let request = GenerationRequest::new(self.model.clone(), prompt)
            .system(system.to_string());
        let response = with_timeout(self.timeout, self.ollama.generate(request))
            .await?
            .map_err(|e| AssistantError::Backend(e.to_string()))?;
        Ok(response.response.trim().to_string())
    }
}

async fn with_timeout<F: Future>(limit: Duration, future: F) -> Result<F::Output, AssistantError> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| AssistantError::Timeout(limit))
}

#[async_trait]
impl Assistant for OllamaAssistant {
    async fn detect_intent(&self, text: &str, history: &[ChatTurn]) -> Result<IntentResult, AssistantError> {
        let answer = self.complete("You classify user requests about their email inbox. Answer with JSON only.", intent_prompt(text, history)).await?;
        match extract_json(&answer).and_then(|json| serde_json::from_str::<Value>(json).ok()) {
            Some(value) => {
                let result = IntentResult::from_json(&value);
                info!("Intent classification: {:?}", result);
                Ok(result)
            }
            None => {
                warn!("Could not parse intent classification, treating as query: {}", answer);
                Ok(IntentResult::new(crate::models::intent::Intent::Query))
            }
        }
    }

    async fn summarize_one(&self, email: &EmailRecord) -> Result<String, AssistantError> {
        let prompt = format!(
            "Summarize this email in one or two short sentences. Mention any action the reader needs to take.\n\n{}",
            email
        );
        self.complete(SYSTEM_PROMPT, prompt).await
    }

    async fn generate_reply(&self, email: &EmailRecord, instruction: &str) -> Result<String, AssistantError> {
        let mut prompt = format!(
            "Write a reply to the following email. Return only the reply body, without a subject line.\n\n{}",
            email
        );
        if !instruction.trim().is_empty() {
            prompt.push_str(&format!("\n\nThe user asked for the reply to: {}", instruction.trim()));
        }
        self.complete("You are a helpful assistant for writing emails.", prompt).await
    }

    async fn categorize(&self, emails: &[EmailRecord]) -> Result<Categories, AssistantError> {
        if emails.is_empty() {
            return Ok(Categories::new());
        }
        let prompt = format!(
            "Group these emails into categories such as Urgent, Work, Personal, Newsletters, Promotions, Social, Finance.
Respond with a JSON object mapping each category name to an array of email IDs. Every ID must appear exactly once.

{}",
            format_emails(emails)
        );
        let answer = self.complete("You organise email inboxes. Answer with JSON only.", prompt).await?;
        let value = extract_json(&answer)
            .and_then(|json| serde_json::from_str::<Value>(json).ok())
            .ok_or_else(|| AssistantError::MalformedResponse(answer.clone()))?;
        Ok(sanitize_categories(&value, emails))
    }

    async fn digest(&self, emails: &[EmailRecord]) -> Result<String, AssistantError> {
        let prompt = format!(
            "Write a short daily digest of these emails from the last day. Start with the most important items, group the rest, and point out anything that needs a reply.\n\n{}",
            format_emails(emails)
        );
        self.complete(SYSTEM_PROMPT, prompt).await
    }

    async fn answer(&self, text: &str, context: &str) -> Result<String, AssistantError> {
        let prompt = if context.is_empty() {
            text.to_string()
        } else {
            format!("Conversation so far:\n{}\n\nUser: {}", context, text)
        };
        self.complete(SYSTEM_PROMPT, prompt).await
    }
}

fn intent_prompt(text: &str, history: &[ChatTurn]) -> String {
    let listed = last_listing(history);
    format!(
        "Classify the user's message into exactly one intent:
- fetch_emails: show or list emails (slots: count, query as a Gmail search string such as \"is:unread\" or \"from:bob@example.com\")
- summarize: summarize emails (slots: count, query)
- generate_reply: draft a reply (slots: email_id or email_index, instruction)
- send_reply: send a drafted reply (slots: reply_text, to, subject, thread_id, email_id)
- delete_email: delete an email (slots: email_id or email_index, confirmed)
- categorize: group the inbox into categories (slots: count)
- digest: daily digest of recent mail
- query: anything else

email_index is zero-based: \"the first one\" or \"#1\" is 0. Only use email_id when the ID appears in the listed emails below.

Respond with JSON only, for example:
{{\"intent\": \"delete_email\", \"email_index\": 1, \"confirmed\": false}}

Recent conversation:
{}

Emails most recently shown to the user:
{}

User message: \"{}\"",
        if history.is_empty() { "(none)".to_string() } else { format_turns(history) },
        if listed.is_empty() { "(none)".to_string() } else { listed },
        text
    )
}

/// `index. [id] from | subject` lines for the emails of the latest listing.
fn last_listing(history: &[ChatTurn]) -> String {
    let emails = history.iter()
        .rev()
        .find_map(|turn| turn.metadata.as_ref()?.get("emails")?.as_array().cloned())
        .unwrap_or_default();

    emails.iter()
        .enumerate()
        .map(|(i, email)| format!(
            "{}. [{}] {} | {}",
            i,
            email.get("id").and_then(Value::as_str).unwrap_or(""),
            email.get("from").and_then(Value::as_str).unwrap_or(""),
            email.get("subject").and_then(Value::as_str).unwrap_or(""),
        ))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Finds the JSON object in a model answer, with or without code fences.
pub fn extract_json(answer: &str) -> Option<&str> {
    let text = answer.trim();
    if let Some(fence) = text.find("```json") {
        let start = fence + 7;
        let end = text[start..].find("```").map_or(text.len(), |pos| start + pos);
        return Some(text[start..end].trim());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Keeps only ids that were actually sent, each in one category, and puts
/// the rest under [`FALLBACK_CATEGORY`].
pub fn sanitize_categories(value: &Value, emails: &[EmailRecord]) -> Categories {
    let known: HashSet<&str> = emails.iter().map(|e| e.id.as_str()).collect();
    let mut placed: HashSet<String> = HashSet::new();
    let mut categories = Categories::new();

    if let Some(map) = value.as_object() {
        for (name, ids) in map {
            let ids: Vec<String> = ids.as_array()
                .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            for id in ids {
                if !known.contains(id.as_str()) {
                    debug!("Dropping unknown id '{}' from category {}", id, name);
                    continue;
                }
                if placed.insert(id.clone()) {
                    categories.entry(name.trim().to_string()).or_insert_with(Vec::new).push(id);
                }
            }
        }
    }

    let leftovers: Vec<String> = emails.iter()
        .filter(|e| !placed.contains(&e.id))
        .map(|e| e.id.clone())
        .collect();
    if !leftovers.is_empty() {
        categories.entry(FALLBACK_CATEGORY.to_string()).or_default().extend(leftovers);
    }
    categories
}
