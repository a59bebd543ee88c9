#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use chrono::{DateTime, Duration, Utc};

use inbox_chat_agent::config::OrchestratorConfig;
use inbox_chat_agent::models::chat_turn::ChatTurn;
use inbox_chat_agent::models::email::EmailRecord;
use inbox_chat_agent::models::gmail_message::{Header, MessageBody, MessagePart, RawMessage};
use inbox_chat_agent::models::intent::{Intent, IntentResult, Slots};
use inbox_chat_agent::models::user::{NewUser, User};
use inbox_chat_agent::services::chat_service::ChatService;
use inbox_chat_agent::services::credential_service::{
    ActiveCredential, CredentialError, CredentialManager, RefreshedToken, TokenRefresher,
};
use inbox_chat_agent::services::gmail_service::{Mailbox, MailboxError, OutgoingMessage};
use inbox_chat_agent::services::llm_service::{Assistant, AssistantError, Categories};
use inbox_chat_agent::stores::{MemoryChatLog, MemoryUserStore, UserStore};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Builds a plain text message the way the Gmail API returns it.
pub fn raw_message(id: &str, from: &str, subject: &str, body: &str) -> RawMessage {
    RawMessage {
        id: id.to_string(),
        thread_id: Some(format!("thread-{}", id)),
        snippet: Some(body.chars().take(40).collect()),
        label_ids: vec!["INBOX".to_string(), "UNREAD".to_string()],
        payload: Some(MessagePart {
            mime_type: Some("multipart/alternative".to_string()),
            headers: vec![
                Header { name: "From".to_string(), value: from.to_string() },
                Header { name: "To".to_string(), value: "me@example.com".to_string() },
                Header { name: "Subject".to_string(), value: subject.to_string() },
                Header { name: "Date".to_string(), value: "Mon, 3 Mar 2025 09:00:00 +0000".to_string() },
            ],
            body: None,
            parts: vec![MessagePart {
                mime_type: Some("text/plain".to_string()),
                body: Some(MessageBody {
                    data: Some(URL_SAFE.encode(body)),
                    size: Some(body.len() as u64),
                }),
                ..Default::default()
            }],
        }),
    }
}

pub fn sample_inbox() -> Vec<RawMessage> {
    vec![
        raw_message("m1", "Alice <alice@example.com>", "Lunch on Friday?", "Are you free for lunch on Friday?"),
        raw_message("m2", "Bob <bob@example.com>", "Quarterly report", "Please send the quarterly report by end of day."),
        raw_message("m3", "News <news@example.com>", "Weekly digest", "Top stories of the week."),
    ]
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MailboxCalls {
    pub list: usize,
    pub get: usize,
    pub send: usize,
    pub trash: usize,
    pub mark_read: usize,
}

/// In-memory mailbox that records every call. Like the provider API, trash
/// answers 404 for an id it does not hold.
#[derive(Default)]
pub struct FakeMailbox {
    messages: Mutex<Vec<RawMessage>>,
    calls: Mutex<MailboxCalls>,
    sent: Mutex<Vec<OutgoingMessage>>,
    fail_list: Mutex<bool>,
}

impl FakeMailbox {
    pub fn with_messages(messages: Vec<RawMessage>) -> Self {
        FakeMailbox {
            messages: Mutex::new(messages),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> MailboxCalls {
        self.calls.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.messages.lock().unwrap().iter().map(|m| m.id.clone()).collect()
    }

    pub fn fail_listing(&self) {
        *self.fail_list.lock().unwrap() = true;
    }
}

#[async_trait]
impl Mailbox for FakeMailbox {
    async fn list(&self, _credential: &ActiveCredential, max_results: u32, _query: &str) -> Result<Vec<String>, MailboxError> {
        self.calls.lock().unwrap().list += 1;
        if *self.fail_list.lock().unwrap() {
            return Err(MailboxError::with_status("list", 503, "service unavailable"));
        }
        Ok(self.ids().into_iter().take(max_results as usize).collect())
    }

    async fn get(&self, _credential: &ActiveCredential, id: &str) -> Result<RawMessage, MailboxError> {
        self.calls.lock().unwrap().get += 1;
        self.messages.lock().unwrap()
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| MailboxError::with_status("get", 404, format!("{} not found", id)))
    }

    async fn send(&self, _credential: &ActiveCredential, message: &OutgoingMessage) -> Result<String, MailboxError> {
        let mut calls = self.calls.lock().unwrap();
        calls.send += 1;
        self.sent.lock().unwrap().push(message.clone());
        Ok(format!("sent-{}", calls.send))
    }

    async fn trash(&self, _credential: &ActiveCredential, id: &str) -> Result<(), MailboxError> {
        self.calls.lock().unwrap().trash += 1;
        let mut messages = self.messages.lock().unwrap();
        let before = messages.len();
        messages.retain(|m| m.id != id);
        if messages.len() == before {
            return Err(MailboxError::with_status("trash", 404, format!("{} not found", id)));
        }
        Ok(())
    }

    async fn set_read(&self, _credential: &ActiveCredential, id: &str, read: bool) -> Result<(), MailboxError> {
        self.calls.lock().unwrap().mark_read += 1;
        let mut messages = self.messages.lock().unwrap();
        if let Some(message) = messages.iter_mut().find(|m| m.id == id) {
            message.label_ids.retain(|l| l != "UNREAD");
            if !read {
                message.label_ids.push("UNREAD".to_string());
            }
        }
        Ok(())
    }
}

/// Assistant that returns scripted intents in order and deterministic text.
#[derive(Default)]
pub struct ScriptedAssistant {
    intents: Mutex<VecDeque<IntentResult>>,
    pub detect_calls: Mutex<usize>,
    pub digest_calls: Mutex<usize>,
}

impl ScriptedAssistant {
    pub fn new(intents: Vec<IntentResult>) -> Self {
        ScriptedAssistant {
            intents: Mutex::new(intents.into()),
            ..Default::default()
        }
    }

    pub fn detect_calls(&self) -> usize {
        *self.detect_calls.lock().unwrap()
    }

    pub fn digest_calls(&self) -> usize {
        *self.digest_calls.lock().unwrap()
    }
}

pub fn intent(intent: Intent, slots: Slots) -> IntentResult {
    IntentResult::with_slots(intent, slots)
}

#[async_trait]
impl Assistant for ScriptedAssistant {
    async fn detect_intent(&self, _text: &str, _history: &[ChatTurn]) -> Result<IntentResult, AssistantError> {
        *self.detect_calls.lock().unwrap() += 1;
        Ok(self.intents.lock().unwrap()
            .pop_front()
            .unwrap_or_else(|| IntentResult::new(Intent::Query)))
    }

    async fn summarize_one(&self, email: &EmailRecord) -> Result<String, AssistantError> {
        Ok(format!("Summary of {}", email.subject))
    }

    async fn generate_reply(&self, email: &EmailRecord, _instruction: &str) -> Result<String, AssistantError> {
        Ok(format!("Thanks for writing about {}.", email.subject))
    }

    async fn categorize(&self, emails: &[EmailRecord]) -> Result<Categories, AssistantError> {
        let mut categories = Categories::new();
        categories.insert("Work".to_string(), emails.iter().map(|e| e.id.clone()).collect());
        Ok(categories)
    }

    async fn digest(&self, emails: &[EmailRecord]) -> Result<String, AssistantError> {
        *self.digest_calls.lock().unwrap() += 1;
        Ok(format!("{} emails arrived today.", emails.len()))
    }

    async fn answer(&self, text: &str, _context: &str) -> Result<String, AssistantError> {
        Ok(format!("You asked: {}", text))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefreshOutcome {
    Succeed,
    Revoked,
}

pub struct FakeRefresher {
    outcome: RefreshOutcome,
    calls: Mutex<usize>,
}

impl FakeRefresher {
    pub fn new(outcome: RefreshOutcome) -> Self {
        FakeRefresher { outcome, calls: Mutex::new(0) }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl TokenRefresher for FakeRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedToken, CredentialError> {
        *self.calls.lock().unwrap() += 1;
        match self.outcome {
            RefreshOutcome::Succeed => Ok(RefreshedToken {
                access_token: "fresh-access".to_string(),
                expires_in: Some(std::time::Duration::from_secs(3600)),
                refresh_token: None,
            }),
            RefreshOutcome::Revoked => Err(CredentialError::ReauthorizationRequired("invalid_grant".to_string())),
        }
    }
}

pub struct TestApp {
    pub service: Arc<ChatService>,
    pub users: Arc<MemoryUserStore>,
    pub log: Arc<MemoryChatLog>,
    pub mailbox: Arc<FakeMailbox>,
    pub assistant: Arc<ScriptedAssistant>,
    pub refresher: Arc<FakeRefresher>,
    pub user: User,
}

pub async fn setup(mailbox: FakeMailbox, assistant: ScriptedAssistant) -> TestApp {
    setup_with_token(
        mailbox,
        assistant,
        Some(Utc::now() + Duration::hours(1)),
        RefreshOutcome::Succeed,
    ).await
}

pub async fn setup_with_token(
    mailbox: FakeMailbox,
    assistant: ScriptedAssistant,
    token_expiry: Option<DateTime<Utc>>,
    outcome: RefreshOutcome,
) -> TestApp {
    init_logging();
    let users = Arc::new(MemoryUserStore::new());
    let user = users.create(NewUser {
        email: "me@example.com".to_string(),
        google_id: "google-me".to_string(),
        refresh_token: "refresh-me".to_string(),
        access_token: Some("access-me".to_string()),
        token_expiry,
    }).await.unwrap();

    let log = Arc::new(MemoryChatLog::new());
    let mailbox = Arc::new(mailbox);
    let assistant = Arc::new(assistant);
    let refresher = Arc::new(FakeRefresher::new(outcome));
    let credentials = Arc::new(CredentialManager::new(users.clone(), refresher.clone()));
    let service = Arc::new(ChatService::new(
        users.clone(),
        log.clone(),
        credentials,
        mailbox.clone(),
        assistant.clone(),
        OrchestratorConfig::default(),
    ));

    TestApp { service, users, log, mailbox, assistant, refresher, user }
}
