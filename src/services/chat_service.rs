use std::sync::Arc;

use futures::future::try_join_all;
use log::{error, info, warn};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::AppError;
use crate::models::chat_turn::{format_turns, ChatTurn, Metadata, Role};
use crate::models::email::EmailRecord;
use crate::models::intent::{Intent, IntentResult, Slots};
use crate::models::orchestration::{ActionTag, OrchestrationResult};
use crate::models::user::User;
use crate::services::credential_service::{ActiveCredential, CredentialManager};
use crate::services::gmail_service::{fetch_emails, Mailbox, OutgoingMessage};
use crate::services::intent_service::IntentResolver;
use crate::services::llm_service::{Assistant, Categories};
use crate::services::message_parser;
use crate::stores::{ConversationLog, UserStore};

const REPLY_PROMPT: &str = "Which email would you like me to reply to? You can say 'reply to email #1' or 'reply to the email from John'.";
const DELETE_PROMPT: &str = "Which email would you like to delete? Say something like 'delete email #1' or 'delete the email from spam@example.com'.";
const SEND_PROMPT: &str = "I need more information to send the reply. Please generate a reply first.";
const EMAIL_NOT_FOUND: &str = "I couldn't find that email. Could you be more specific?";

/// Where an email reference in the slots points.
#[derive(Debug, PartialEq)]
enum Target {
    Id(String),
    /// The ordinal lies beyond the bounded re-fetch.
    OutOfRange(usize),
}

/// Drives one chat turn from text to response, mailbox side effects included.
pub struct ChatService {
    users: Arc<dyn UserStore>,
    log: Arc<dyn ConversationLog>,
    credentials: Arc<CredentialManager>,
    mailbox: Arc<dyn Mailbox>,
    assistant: Arc<dyn Assistant>,
    resolver: IntentResolver,
    config: OrchestratorConfig,
}

impl ChatService {
    pub fn new(
        users: Arc<dyn UserStore>,
        log: Arc<dyn ConversationLog>,
        credentials: Arc<CredentialManager>,
        mailbox: Arc<dyn Mailbox>,
        assistant: Arc<dyn Assistant>,
        config: OrchestratorConfig,
    ) -> Self {
        ChatService {
            users,
            log,
            credentials,
            mailbox,
            resolver: IntentResolver::new(assistant.clone()),
            assistant,
            config,
        }
    }

    /// Processes one user message. Both sides of the turn are written to the
    /// conversation log; failures are logged as an assistant turn too before
    /// being returned.
    pub async fn process_message(&self, user_id: Uuid, text: &str) -> Result<OrchestrationResult, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Validation("Message must not be empty".to_string()));
        }

        let user = self.users
            .get_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

        self.log.append(user.id, Role::User, text.to_string(), None).await?;
        info!("Processing message for user {}", user.id);

        match self.run_turn(&user, text).await {
            Ok(result) => {
                // Plain answers still record their action tag in the log.
                let persisted = result.metadata.clone().or_else(|| {
                    result.action_taken.map(|action| {
                        let mut metadata = Map::new();
                        metadata.insert("action".to_string(), Value::String(action.as_str().to_string()));
                        metadata
                    })
                });
                self.log
                    .append(user.id, Role::Assistant, result.message.clone(), persisted)
                    .await?;
                Ok(result)
            }
            Err(err) => {
                error!("Error processing chat for user {}: {:?}", user.id, err);
                let mut metadata = Map::new();
                metadata.insert("error".to_string(), Value::String(err.kind().to_string()));
                if let Err(log_err) = self.log
                    .append(user.id, Role::Assistant, err.user_message(), Some(metadata))
                    .await
                {
                    error!("Failed to persist error turn for user {}: {}", user.id, log_err);
                }
                Err(err)
            }
        }
    }

    /// Chronological chat history of a known user.
    pub async fn history(&self, user_id: Uuid, limit: usize) -> Result<Vec<ChatTurn>, AppError> {
        if self.users.get_by_id(user_id).await?.is_none() {
            return Err(AppError::NotFound(format!("User {} not found", user_id)));
        }
        Ok(self.log.recent(user_id, limit).await?)
    }

    async fn run_turn(&self, user: &User, text: &str) -> Result<OrchestrationResult, AppError> {
        let history = self.prior_history(user.id).await?;
        let intent = self.resolver.resolve(text, &history).await?;
        info!("Dispatching intent {} for user {}", intent.intent, user.id);
        self.dispatch(user, text, intent, &history).await
    }

    /// Recent turns before the message being processed, oldest first.
    async fn prior_history(&self, user_id: Uuid) -> Result<Vec<ChatTurn>, AppError> {
        let mut turns = self.log.recent(user_id, self.config.history_window + 1).await?;
        // The last entry is the user turn appended for this call.
        turns.pop();
        Ok(turns)
    }

    async fn dispatch(
        &self,
        user: &User,
        text: &str,
        intent: IntentResult,
        history: &[ChatTurn],
    ) -> Result<OrchestrationResult, AppError> {
        let slots = &intent.slots;
        match intent.intent {
            Intent::FetchEmails | Intent::Summarize => self.fetch_and_summarize(user, slots).await,
            Intent::GenerateReply => self.generate_reply(user, slots).await,
            Intent::SendReply => self.send_reply(user, slots).await,
            Intent::DeleteEmail => self.delete_email(user, slots).await,
            Intent::Categorize => self.categorize(user, slots).await,
            Intent::Digest => self.digest(user).await,
            Intent::Query => self.answer_query(text, history).await,
        }
    }

    async fn credential(&self, user: &User) -> Result<ActiveCredential, AppError> {
        Ok(self.credentials.obtain(user).await?)
    }

    async fn fetch_and_summarize(&self, user: &User, slots: &Slots) -> Result<OrchestrationResult, AppError> {
        let count = slots.count
            .unwrap_or(self.config.default_fetch_count)
            .clamp(1, self.config.max_fetch_count);
        let query = slots.query.clone().unwrap_or_default();

        let credential = self.credential(user).await?;
        info!("Fetching {} emails with query: '{}'", count, query);
        let emails = fetch_emails(self.mailbox.as_ref(), &credential, count, &query).await?;

        if emails.is_empty() {
            return Ok(OrchestrationResult::with_metadata(
                "No emails found matching your criteria.",
                ActionTag::FetchEmails,
                object(json!({ "emails": [], "count": 0, "query": query })),
            ));
        }

        // try_join_all keeps input order, so summaries line up with emails.
        let summaries = try_join_all(emails.iter().map(|email| self.assistant.summarize_one(email))).await?;

        let enriched: Vec<Value> = emails.iter()
            .zip(summaries.iter())
            .map(|(email, summary)| json!({
                "id": email.id,
                "thread_id": email.thread_id,
                "from": email.from,
                "subject": email.subject,
                "date": email.date,
                "snippet": email.snippet,
                "body": email.body_preview(self.config.body_preview_chars),
                "summary": summary,
                "labels": email.labels,
                "unread": email.is_unread(),
            }))
            .collect();

        Ok(OrchestrationResult::with_metadata(
            format_listing(&emails, &summaries, &query),
            ActionTag::FetchEmails,
            object(json!({ "emails": enriched, "count": emails.len(), "query": query })),
        ))
    }

    async fn generate_reply(&self, user: &User, slots: &Slots) -> Result<OrchestrationResult, AppError> {
        if !has_target(slots) {
            return Ok(OrchestrationResult::text(REPLY_PROMPT, ActionTag::ReplyPrompt));
        }

        let credential = self.credential(user).await?;
        let id = match self.resolve_target(&credential, slots).await? {
            Target::Id(id) => id,
            Target::OutOfRange(index) => {
                info!("Reply target #{} is outside the re-fetched window", index + 1);
                return Ok(OrchestrationResult::text(EMAIL_NOT_FOUND, ActionTag::NotFound));
            }
        };
        let Some(email) = self.load_email(&credential, &id).await? else {
            return Ok(OrchestrationResult::text(EMAIL_NOT_FOUND, ActionTag::NotFound));
        };

        let instruction = slots.instruction.as_deref().unwrap_or("");
        let reply_text = self.assistant.generate_reply(&email, instruction).await?;
        let message = format!(
            "Here's a suggested reply:\n\n{}\n\nWould you like me to send this? (Say 'yes send it' or 'no thanks')",
            reply_text
        );

        Ok(OrchestrationResult::with_metadata(
            message,
            ActionTag::GenerateReply,
            object(json!({
                "email_id": email.id,
                "reply_text": reply_text,
                "thread_id": email.thread_id,
                "to": email.from,
                "subject": email.reply_subject(),
            })),
        ))
    }

    async fn send_reply(&self, user: &User, slots: &Slots) -> Result<OrchestrationResult, AppError> {
        if slots.confirmed == Some(false) {
            return Ok(OrchestrationResult::text("Okay, I won't send that reply.", ActionTag::SendCancelled));
        }

        let (Some(body), Some(to), Some(subject)) = (
            non_empty(&slots.reply_text),
            non_empty(&slots.to),
            non_empty(&slots.subject),
        ) else {
            return Ok(OrchestrationResult::text(SEND_PROMPT, ActionTag::ReplyPrompt));
        };
        for id in [non_empty(&slots.email_id), non_empty(&slots.thread_id)].into_iter().flatten() {
            validate_email_id(id)?;
        }

        let credential = self.credential(user).await?;
        let outgoing = OutgoingMessage {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            thread_id: non_empty(&slots.thread_id).map(str::to_string),
        };
        let sent_id = self.mailbox.send(&credential, &outgoing).await?;
        info!("Sent reply {} for user {}", sent_id, user.id);

        // The reply went out, so a failure here only leaves the original unread.
        if let Some(original) = non_empty(&slots.email_id) {
            if let Err(e) = self.mailbox.set_read(&credential, original, true).await {
                warn!("Could not mark {} as read after replying: {}", original, e);
            }
        }

        Ok(OrchestrationResult::with_metadata(
            format!("Reply sent successfully to {}!", to),
            ActionTag::SendReply,
            object(json!({
                "sent_message_id": sent_id,
                "to": outgoing.to,
                "subject": outgoing.subject,
                "thread_id": outgoing.thread_id,
            })),
        ))
    }

    async fn delete_email(&self, user: &User, slots: &Slots) -> Result<OrchestrationResult, AppError> {
        if slots.confirmed == Some(false) {
            return Ok(OrchestrationResult::text("Okay, I won't delete that email.", ActionTag::DeleteCancelled));
        }
        if !has_target(slots) {
            return Ok(OrchestrationResult::text(DELETE_PROMPT, ActionTag::DeletePrompt));
        }

        let credential = self.credential(user).await?;
        let id = match self.resolve_target(&credential, slots).await? {
            Target::Id(id) => id,
            Target::OutOfRange(index) => {
                info!("Delete target #{} is outside the re-fetched window", index + 1);
                return Ok(OrchestrationResult::text(EMAIL_NOT_FOUND, ActionTag::NotFound));
            }
        };

        if slots.confirmed == Some(true) {
            match self.mailbox.trash(&credential, &id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => warn!("Email {} was already gone: {}", id, e),
                Err(e) => return Err(e.into()),
            }
            return Ok(OrchestrationResult::with_metadata(
                "Email deleted successfully!",
                ActionTag::DeleteEmail,
                object(json!({ "deleted_email_id": id })),
            ));
        }

        let Some(email) = self.load_email(&credential, &id).await? else {
            return Ok(OrchestrationResult::text(EMAIL_NOT_FOUND, ActionTag::NotFound));
        };
        let message = format!(
            "Are you sure you want to delete:\n\nFrom: {}\nSubject: {}\n\nSay 'yes delete it' to confirm.",
            email.from, email.subject
        );
        Ok(OrchestrationResult::with_metadata(
            message,
            ActionTag::DeleteConfirm,
            object(json!({
                "email_id": email.id,
                "email": {
                    "id": email.id,
                    "thread_id": email.thread_id,
                    "from": email.from,
                    "subject": email.subject,
                    "date": email.date,
                    "snippet": email.snippet,
                },
            })),
        ))
    }

    async fn categorize(&self, user: &User, slots: &Slots) -> Result<OrchestrationResult, AppError> {
        let count = slots.count
            .unwrap_or(self.config.categorize_batch)
            .clamp(1, self.config.max_fetch_count);

        let credential = self.credential(user).await?;
        let emails = fetch_emails(self.mailbox.as_ref(), &credential, count, "").await?;
        if emails.is_empty() {
            return Ok(OrchestrationResult::with_metadata(
                "Your inbox is empty, so there is nothing to categorize.",
                ActionTag::Categorize,
                object(json!({ "categories": {}, "total_emails": 0 })),
            ));
        }

        let categories = self.assistant.categorize(&emails).await?;
        let grouped: Map<String, Value> = categories.iter()
            .map(|(name, ids)| {
                let entries: Vec<Value> = ids.iter()
                    .filter_map(|id| emails.iter().find(|e| &e.id == id))
                    .map(|e| json!({ "id": e.id, "from": e.from, "subject": e.subject }))
                    .collect();
                (name.clone(), Value::Array(entries))
            })
            .collect();

        Ok(OrchestrationResult::with_metadata(
            format_categories(&categories, &emails),
            ActionTag::Categorize,
            object(json!({ "categories": grouped, "total_emails": emails.len() })),
        ))
    }

    async fn digest(&self, user: &User) -> Result<OrchestrationResult, AppError> {
        let credential = self.credential(user).await?;
        let emails = fetch_emails(
            self.mailbox.as_ref(),
            &credential,
            self.config.digest_batch,
            &self.config.digest_query,
        ).await?;

        let message = if emails.is_empty() {
            "You have no new emails from the last day.".to_string()
        } else {
            self.assistant.digest(&emails).await?
        };
        Ok(OrchestrationResult::with_metadata(
            message,
            ActionTag::Digest,
            object(json!({ "emails_count": emails.len() })),
        ))
    }

    async fn answer_query(&self, text: &str, history: &[ChatTurn]) -> Result<OrchestrationResult, AppError> {
        let start = history.len().saturating_sub(self.config.query_context_turns);
        let context = format_turns(&history[start..]);
        let answer = self.assistant.answer(text, &context).await?;
        Ok(OrchestrationResult::text(answer, ActionTag::Query))
    }

    /// Uses the explicit id when given, otherwise looks the ordinal up in a
    /// fresh listing bounded by `ordinal_refetch_limit`.
    async fn resolve_target(&self, credential: &ActiveCredential, slots: &Slots) -> Result<Target, AppError> {
        if let Some(id) = non_empty(&slots.email_id) {
            validate_email_id(id)?;
            return Ok(Target::Id(id.to_string()));
        }

        let index = slots.email_index
            .ok_or_else(|| AppError::Validation("No email was specified".to_string()))?;
        let ids = self.mailbox
            .list(credential, self.config.ordinal_refetch_limit, "")
            .await?;
        Ok(match ids.into_iter().nth(index) {
            Some(id) => Target::Id(id),
            None => Target::OutOfRange(index),
        })
    }

    /// `None` when the provider does not know the id.
    async fn load_email(&self, credential: &ActiveCredential, id: &str) -> Result<Option<EmailRecord>, AppError> {
        match self.mailbox.get(credential, id).await {
            Ok(raw) => Ok(Some(message_parser::parse(&raw))),
            Err(e) if e.is_not_found() => {
                info!("Email {} not found", id);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn has_target(slots: &Slots) -> bool {
    non_empty(&slots.email_id).is_some() || slots.email_index.is_some()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn validate_email_id(id: &str) -> Result<(), AppError> {
    let valid = id.len() <= 256
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!("'{}' is not a valid email id", id)))
    }
}

fn object(value: Value) -> Metadata {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn format_listing(emails: &[EmailRecord], summaries: &[String], query: &str) -> String {
    let mut text = if query.is_empty() {
        format!("Here are your {} most recent emails:\n\n", emails.len())
    } else {
        format!("Here are {} emails matching \"{}\":\n\n", emails.len(), query)
    };
    for (i, (email, summary)) in emails.iter().zip(summaries).enumerate() {
        text.push_str(&format!(
            "{}. {}{}\n   From: {} | {}\n   {}\n\n",
            i + 1,
            if email.is_unread() { "[unread] " } else { "" },
            email.subject,
            email.from,
            email.date,
            summary
        ));
    }
    text.push_str("You can ask me to reply to or delete any of these by number, e.g. 'reply to #1'.");
    text
}

fn format_categories(categories: &Categories, emails: &[EmailRecord]) -> String {
    let mut text = format!(
        "I sorted your {} most recent emails into {} categories:\n",
        emails.len(),
        categories.len()
    );
    for (name, ids) in categories {
        text.push_str(&format!("\n{} ({})\n", name, ids.len()));
        for id in ids {
            if let Some(email) = emails.iter().find(|e| &e.id == id) {
                text.push_str(&format!("  - {} (from {})\n", email.subject, email.from));
            }
        }
    }
    text.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use crate::models::gmail_message::{Header, MessagePart, RawMessage};
    use crate::models::user::NewUser;
    use crate::services::credential_service::{CredentialError, MockTokenRefresher};
    use crate::services::gmail_service::{MailboxError, MockMailbox};
    use crate::services::llm_service::MockAssistant;
    use crate::stores::{MemoryChatLog, MemoryUserStore};

    struct Harness {
        service: ChatService,
        log: Arc<MemoryChatLog>,
        user: User,
    }

    async fn harness(mailbox: MockMailbox, assistant: MockAssistant) -> Harness {
        harness_with_token(mailbox, assistant, Some(Utc::now() + Duration::hours(1)), MockTokenRefresher::new()).await
    }

    async fn harness_with_token(
        mailbox: MockMailbox,
        assistant: MockAssistant,
        expiry: Option<chrono::DateTime<Utc>>,
        refresher: MockTokenRefresher,
    ) -> Harness {
        let users = Arc::new(MemoryUserStore::new());
        let user = users.create(NewUser {
            email: "me@example.com".to_string(),
            google_id: "google-1".to_string(),
            refresh_token: "refresh".to_string(),
            access_token: Some("access".to_string()),
            token_expiry: expiry,
        }).await.unwrap();
        let log = Arc::new(MemoryChatLog::new());
        let credentials = Arc::new(CredentialManager::new(users.clone(), Arc::new(refresher)));
        let service = ChatService::new(
            users,
            log.clone(),
            credentials,
            Arc::new(mailbox),
            Arc::new(assistant),
            OrchestratorConfig::default(),
        );
        Harness { service, log, user }
    }

    fn raw(id: &str, from: &str, subject: &str) -> RawMessage {
        RawMessage {
            id: id.to_string(),
            thread_id: Some(format!("t-{}", id)),
            snippet: Some(format!("snippet {}", id)),
            label_ids: vec!["INBOX".to_string()],
            payload: Some(MessagePart {
                headers: vec![
                    Header { name: "From".to_string(), value: from.to_string() },
                    Header { name: "Subject".to_string(), value: subject.to_string() },
                ],
                ..Default::default()
            }),
        }
    }

    fn intent(intent: Intent, slots: Slots) -> IntentResult {
        IntentResult::with_slots(intent, slots)
    }

    #[tokio::test]
    async fn ordinal_resolves_against_fresh_listing() {
        let mut mailbox = MockMailbox::new();
        mailbox.expect_list()
            .withf(|_, max, query| *max == 10 && query.is_empty())
            .times(1)
            .returning(|_, _, _| Ok(vec!["a".to_string(), "b".to_string(), "c".to_string()]));
        mailbox.expect_get()
            .withf(|_, id| id == "b")
            .times(1)
            .returning(|_, id| Ok(raw(id, "bob@example.com", "Report")));
        mailbox.expect_trash().never();

        let mut assistant = MockAssistant::new();
        assistant.expect_detect_intent().returning(|_, _| Ok(intent(
            Intent::DeleteEmail,
            Slots { email_index: Some(1), ..Default::default() },
        )));

        let h = harness(mailbox, assistant).await;
        let result = h.service.process_message(h.user.id, "delete the second one").await.unwrap();

        assert_eq!(result.action_taken, Some(ActionTag::DeleteConfirm));
        let metadata = result.metadata.unwrap();
        assert_eq!(metadata["email_id"], "b");
        assert_eq!(metadata["action"], "delete_confirm");
        assert!(result.message.contains("bob@example.com"));
    }

    #[tokio::test]
    async fn yes_after_delete_prompt_trashes_presented_email_once() {
        let mut mailbox = MockMailbox::new();
        mailbox.expect_list()
            .times(1)
            .returning(|_, _, _| Ok(vec!["a".to_string(), "b".to_string(), "c".to_string()]));
        mailbox.expect_get()
            .times(1)
            .returning(|_, id| Ok(raw(id, "bob@example.com", "Report")));
        mailbox.expect_trash()
            .withf(|_, id| id == "b")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut assistant = MockAssistant::new();
        assistant.expect_detect_intent()
            .times(1)
            .returning(|_, _| Ok(intent(
                Intent::DeleteEmail,
                Slots { email_index: Some(1), ..Default::default() },
            )));

        let h = harness(mailbox, assistant).await;
        h.service.process_message(h.user.id, "delete email #2").await.unwrap();
        let result = h.service.process_message(h.user.id, "yes").await.unwrap();

        assert_eq!(result.action_taken, Some(ActionTag::DeleteEmail));
        assert_eq!(result.metadata.unwrap()["deleted_email_id"], "b");
    }

    #[tokio::test]
    async fn declining_delete_makes_no_mailbox_call() {
        let mut mailbox = MockMailbox::new();
        mailbox.expect_list().times(1).returning(|_, _, _| Ok(vec!["a".to_string()]));
        mailbox.expect_get().times(1).returning(|_, id| Ok(raw(id, "x@example.com", "Spam")));
        mailbox.expect_trash().never();

        let mut assistant = MockAssistant::new();
        assistant.expect_detect_intent().times(1).returning(|_, _| Ok(intent(
            Intent::DeleteEmail,
            Slots { email_index: Some(0), ..Default::default() },
        )));

        let h = harness(mailbox, assistant).await;
        h.service.process_message(h.user.id, "delete the first email").await.unwrap();
        let result = h.service.process_message(h.user.id, "no thanks").await.unwrap();
        assert_eq!(result.action_taken, Some(ActionTag::DeleteCancelled));
    }

    #[tokio::test]
    async fn ordinal_beyond_window_reports_not_found() {
        let mut mailbox = MockMailbox::new();
        mailbox.expect_list().returning(|_, _, _| Ok(vec!["a".to_string(), "b".to_string()]));
        mailbox.expect_get().never();

        let mut assistant = MockAssistant::new();
        assistant.expect_detect_intent().returning(|_, _| Ok(intent(
            Intent::GenerateReply,
            Slots { email_index: Some(12), ..Default::default() },
        )));
        assistant.expect_generate_reply().never();

        let h = harness(mailbox, assistant).await;
        let result = h.service.process_message(h.user.id, "reply to #13").await.unwrap();
        assert_eq!(result.action_taken, Some(ActionTag::NotFound));
        assert!(result.message.contains("couldn't find that email"));
    }

    #[tokio::test]
    async fn reply_without_target_asks_which_email() {
        let mut mailbox = MockMailbox::new();
        mailbox.expect_list().never();

        let mut assistant = MockAssistant::new();
        assistant.expect_detect_intent()
            .returning(|_, _| Ok(IntentResult::new(Intent::GenerateReply)));

        let h = harness(mailbox, assistant).await;
        let result = h.service.process_message(h.user.id, "write a reply").await.unwrap();
        assert_eq!(result.action_taken, Some(ActionTag::ReplyPrompt));
        assert!(result.metadata.is_none());
    }

    #[tokio::test]
    async fn send_reply_without_recipient_never_sends() {
        let mut mailbox = MockMailbox::new();
        mailbox.expect_send().never();

        let mut assistant = MockAssistant::new();
        assistant.expect_detect_intent().returning(|_, _| Ok(intent(
            Intent::SendReply,
            Slots {
                reply_text: Some("Hi there".to_string()),
                subject: Some("Re: Hello".to_string()),
                ..Default::default()
            },
        )));

        let h = harness(mailbox, assistant).await;
        let result = h.service.process_message(h.user.id, "send it to them").await.unwrap();
        assert!(result.message.contains("generate a reply first"));
        assert_eq!(result.action_taken, Some(ActionTag::ReplyPrompt));
    }

    #[tokio::test]
    async fn drafted_reply_is_sent_on_yes() {
        let mut mailbox = MockMailbox::new();
        mailbox.expect_get()
            .withf(|_, id| id == "m1")
            .times(1)
            .returning(|_, id| Ok(raw(id, "alice@example.com", "Lunch")));
        mailbox.expect_send()
            .withf(|_, msg| {
                msg.to == "alice@example.com"
                    && msg.subject == "Re: Lunch"
                    && msg.body == "Noon works for me."
                    && msg.thread_id.as_deref() == Some("t-m1")
            })
            .times(1)
            .returning(|_, _| Ok("sent-1".to_string()));
        mailbox.expect_set_read()
            .withf(|_, id, read| id == "m1" && *read)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut assistant = MockAssistant::new();
        assistant.expect_detect_intent().times(1).returning(|_, _| Ok(intent(
            Intent::GenerateReply,
            Slots { email_id: Some("m1".to_string()), ..Default::default() },
        )));
        assistant.expect_generate_reply()
            .times(1)
            .returning(|_, _| Ok("Noon works for me.".to_string()));

        let h = harness(mailbox, assistant).await;
        let draft = h.service.process_message(h.user.id, "reply to the lunch email").await.unwrap();
        assert_eq!(draft.action_taken, Some(ActionTag::GenerateReply));

        let sent = h.service.process_message(h.user.id, "yes send it").await.unwrap();
        assert_eq!(sent.action_taken, Some(ActionTag::SendReply));
        assert_eq!(sent.metadata.unwrap()["sent_message_id"], "sent-1");
    }

    #[tokio::test]
    async fn send_reply_rejects_malformed_ids_before_sending() {
        for (email_id, thread_id) in [("../../etc", "t-1"), ("m1", "t-1/../../drafts")] {
            let mut mailbox = MockMailbox::new();
            mailbox.expect_send().never();
            mailbox.expect_set_read().never();

            let mut assistant = MockAssistant::new();
            assistant.expect_detect_intent().returning(move |_, _| Ok(intent(
                Intent::SendReply,
                Slots {
                    email_id: Some(email_id.to_string()),
                    thread_id: Some(thread_id.to_string()),
                    reply_text: Some("See you then".to_string()),
                    to: Some("alice@example.com".to_string()),
                    subject: Some("Re: Lunch".to_string()),
                    ..Default::default()
                },
            )));

            let h = harness(mailbox, assistant).await;
            let err = h.service.process_message(h.user.id, "send the reply to alice").await.unwrap_err();
            assert_eq!(err.kind(), "validation_error");
        }
    }

    #[tokio::test]
    async fn confirmed_delete_of_already_trashed_email_succeeds() {
        let mut mailbox = MockMailbox::new();
        mailbox.expect_trash()
            .withf(|_, id| id == "m7")
            .times(1)
            .returning(|_, id| Err(MailboxError::with_status("trash", 404, format!("{} not found", id))));

        let mut assistant = MockAssistant::new();
        assistant.expect_detect_intent().returning(|_, _| Ok(intent(
            Intent::DeleteEmail,
            Slots { email_id: Some("m7".to_string()), confirmed: Some(true), ..Default::default() },
        )));

        let h = harness(mailbox, assistant).await;
        let result = h.service.process_message(h.user.id, "delete m7, I'm sure").await.unwrap();
        assert_eq!(result.action_taken, Some(ActionTag::DeleteEmail));
        assert_eq!(result.metadata.unwrap()["deleted_email_id"], "m7");
    }

    #[tokio::test]
    async fn summaries_stay_with_their_email() {
        let mut mailbox = MockMailbox::new();
        mailbox.expect_list()
            .withf(|_, max, query| *max == 2 && query == "is:unread")
            .returning(|_, _, _| Ok(vec!["x".to_string(), "y".to_string()]));
        mailbox.expect_get()
            .returning(|_, id| Ok(raw(id, "someone@example.com", &format!("Subject {}", id))));

        let mut assistant = MockAssistant::new();
        assistant.expect_detect_intent().returning(|_, _| Ok(intent(
            Intent::FetchEmails,
            Slots { count: Some(2), query: Some("is:unread".to_string()), ..Default::default() },
        )));
        assistant.expect_summarize_one()
            .returning(|email| Ok(format!("summary of {}", email.id)));

        let h = harness(mailbox, assistant).await;
        let result = h.service.process_message(h.user.id, "show my 2 unread emails").await.unwrap();

        let metadata = result.metadata.unwrap();
        assert_eq!(metadata["count"], 2);
        let emails = metadata["emails"].as_array().unwrap();
        for email in emails {
            let id = email["id"].as_str().unwrap();
            assert_eq!(email["summary"], format!("summary of {}", id));
        }
    }

    #[tokio::test]
    async fn mailbox_failure_is_persisted_then_returned() {
        let mut mailbox = MockMailbox::new();
        mailbox.expect_list()
            .returning(|_, _, _| Err(MailboxError::with_status("list", 503, "backend unavailable")));

        let mut assistant = MockAssistant::new();
        assistant.expect_detect_intent()
            .returning(|_, _| Ok(IntentResult::new(Intent::Digest)));

        let h = harness(mailbox, assistant).await;
        let err = h.service.process_message(h.user.id, "give me my digest").await.unwrap_err();
        assert_eq!(err.kind(), "mailbox_operation_failed");

        let turns = h.log.recent(h.user.id, 10).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].metadata_str("error"), Some("mailbox_operation_failed"));
    }

    #[tokio::test]
    async fn revoked_refresh_token_asks_for_reauthorization() {
        let mut mailbox = MockMailbox::new();
        mailbox.expect_list().never();

        let mut assistant = MockAssistant::new();
        assistant.expect_detect_intent()
            .returning(|_, _| Ok(IntentResult::new(Intent::Categorize)));

        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh()
            .times(1)
            .returning(|_| Err(CredentialError::ReauthorizationRequired("invalid_grant".to_string())));

        let h = harness_with_token(mailbox, assistant, Some(Utc::now() - Duration::hours(2)), refresher).await;
        let err = h.service.process_message(h.user.id, "categorize my inbox").await.unwrap_err();
        assert!(matches!(err, AppError::ReauthorizationRequired(_)));
        assert_eq!(h.log.recent(h.user.id, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn query_uses_recent_context_without_mailbox() {
        let mut mailbox = MockMailbox::new();
        mailbox.expect_list().never();
        mailbox.expect_get().never();

        let mut assistant = MockAssistant::new();
        assistant.expect_detect_intent()
            .returning(|_, _| Ok(IntentResult::new(Intent::Query)));
        assistant.expect_answer()
            .withf(|text, context| text == "what can you do?" && context.is_empty())
            .times(1)
            .returning(|_, _| Ok("I can manage your inbox.".to_string()));

        let h = harness(mailbox, assistant).await;
        let result = h.service.process_message(h.user.id, "what can you do?").await.unwrap();
        assert_eq!(result.action_taken, Some(ActionTag::Query));
        assert!(result.metadata.is_none());
    }

    #[tokio::test]
    async fn unknown_user_is_not_logged() {
        let h = harness(MockMailbox::new(), MockAssistant::new()).await;
        let stranger = Uuid::new_v4();
        let err = h.service.process_message(stranger, "hello").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(h.log.recent(stranger, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_email_id_is_a_validation_error() {
        let mut assistant = MockAssistant::new();
        assistant.expect_detect_intent().returning(|_, _| Ok(intent(
            Intent::DeleteEmail,
            Slots { email_id: Some("../../etc".to_string()), ..Default::default() },
        )));

        let h = harness(MockMailbox::new(), assistant).await;
        let err = h.service.process_message(h.user.id, "delete ../../etc").await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn categories_text_lists_subjects() {
        let emails = vec![
            EmailRecord { id: "a".into(), subject: "Invoice".into(), from: "billing@example.com".into(), ..Default::default() },
            EmailRecord { id: "b".into(), subject: "Party".into(), from: "friend@example.com".into(), ..Default::default() },
        ];
        let mut categories = Categories::new();
        categories.insert("Finance".to_string(), vec!["a".to_string()]);
        categories.insert("Personal".to_string(), vec!["b".to_string()]);

        let text = format_categories(&categories, &emails);
        assert!(text.contains("Finance (1)"));
        assert!(text.contains("  - Party (from friend@example.com)"));
    }
}
