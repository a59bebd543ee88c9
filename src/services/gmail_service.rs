use std::time::Duration;
use async_trait::async_trait;
use base64::{engine::general_purpose::{STANDARD, URL_SAFE}, Engine as _};
use futures::future::try_join_all;
use log::{debug, error, info, warn};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

use crate::models::email::EmailRecord;
use crate::models::gmail_message::{
    ListMessagesResponse, ModifyMessageRequest, RawMessage, SendMessageRequest,
};
use crate::services::credential_service::ActiveCredential;
use crate::services::message_parser;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// The single failure value of every mailbox operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Mailbox operation `{operation}` failed: {cause}")]
pub struct MailboxError {
    pub operation: &'static str,
    pub status: Option<u16>,
    pub cause: String,
}

impl MailboxError {
    pub fn new(operation: &'static str, cause: impl Into<String>) -> Self {
        MailboxError { operation, status: None, cause: cause.into() }
    }

    pub fn with_status(operation: &'static str, status: u16, cause: impl Into<String>) -> Self {
        MailboxError { operation, status: Some(status), cause: cause.into() }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

/// A message to hand to the provider for sending.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
}

/// Remote mailbox operations, all scoped to the credential's mailbox.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Ids of messages matching `query`, passed through to the provider as is.
    async fn list(
        &self,
        credential: &ActiveCredential,
        max_results: u32,
        query: &str,
    ) -> Result<Vec<String>, MailboxError>;

    async fn get(&self, credential: &ActiveCredential, id: &str) -> Result<RawMessage, MailboxError>;

    /// Sends a message, threaded under `thread_id` when present. Returns the new id.
    async fn send(
        &self,
        credential: &ActiveCredential,
        message: &OutgoingMessage,
    ) -> Result<String, MailboxError>;

    /// Moves a message to the trash. Repeating it for the same id is not fatal.
    async fn trash(&self, credential: &ActiveCredential, id: &str) -> Result<(), MailboxError>;

    async fn set_read(
        &self,
        credential: &ActiveCredential,
        id: &str,
        read: bool,
    ) -> Result<(), MailboxError>;
}

/// Lists then fetches and parses each message. Results keep the listing order.
pub async fn fetch_emails(
    mailbox: &dyn Mailbox,
    credential: &ActiveCredential,
    max_results: u32,
    query: &str,
) -> Result<Vec<EmailRecord>, MailboxError> {
    let ids = mailbox.list(credential, max_results, query).await?;
    if ids.is_empty() {
        info!("No messages matched query '{}'", query);
        return Ok(Vec::new());
    }

    debug!("Loading {} message payloads", ids.len());
    let payloads = try_join_all(ids.iter().map(|id| mailbox.get(credential, id))).await?;
    Ok(payloads.iter().map(message_parser::parse).collect())
}

/// Gmail REST implementation of [`Mailbox`].
#[derive(Clone)]
pub struct GmailClient {
    client: Client,
    base_url: String,
}

impl GmailClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MailboxError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MailboxError::new("init", e.to_string()))?;
        Ok(GmailClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn execute(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<reqwest::Response, MailboxError> {
        let response = request.send().await.map_err(|e| {
            error!("Gmail {} request failed: {}", operation, e);
            MailboxError::new(operation, e.to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!("Gmail {} returned {}: {}", operation, status, body);
        Err(MailboxError::with_status(
            operation,
            status.as_u16(),
            format!("{} {}", status, body.trim()),
        ))
    }

    async fn read_json<T: DeserializeOwned>(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<T, MailboxError> {
        response.json::<T>()
            .await
            .map_err(|e| MailboxError::new(operation, format!("invalid response body: {}", e)))
    }
}

#[async_trait]
impl Mailbox for GmailClient {
    async fn list(
        &self,
        credential: &ActiveCredential,
        max_results: u32,
        query: &str,
    ) -> Result<Vec<String>, MailboxError> {
        info!("Listing up to {} messages (query: '{}')", max_results, query);
        let max = max_results.to_string();
        let mut params = vec![("maxResults", max.as_str())];
        if !query.is_empty() {
            params.push(("q", query));
        }

        let request = self.client
            .get(self.url("messages"))
            .bearer_auth(credential.access_token())
            .query(&params);
        let response = self.execute("list", request).await?;
        let listing: ListMessagesResponse = Self::read_json("list", response).await?;
        Ok(listing.messages.into_iter().map(|m| m.id).collect())
    }

    async fn get(&self, credential: &ActiveCredential, id: &str) -> Result<RawMessage, MailboxError> {
        debug!("Fetching message details for ID: {}", id);
        let request = self.client
            .get(self.url(&format!("messages/{}", id)))
            .bearer_auth(credential.access_token())
            .query(&[("format", "full")]);
        let response = self.execute("get", request).await?;
        Self::read_json("get", response).await
    }

    async fn send(
        &self,
        credential: &ActiveCredential,
        message: &OutgoingMessage,
    ) -> Result<String, MailboxError> {
        info!("Sending message (threaded: {})", message.thread_id.is_some());
        let payload = SendMessageRequest {
            raw: URL_SAFE.encode(build_raw_message(message)),
            thread_id: message.thread_id.clone().filter(|t| !t.is_empty()),
        };

        let request = self.client
            .post(self.url("messages/send"))
            .bearer_auth(credential.access_token())
            .json(&payload);
        let response = self.execute("send", request).await?;
        let sent: RawMessage = Self::read_json("send", response).await?;
        Ok(sent.id)
    }

    async fn trash(&self, credential: &ActiveCredential, id: &str) -> Result<(), MailboxError> {
        info!("Moving message {} to trash", id);
        let request = self.client
            .post(self.url(&format!("messages/{}/trash", id)))
            .bearer_auth(credential.access_token());
        absorb_missing(id, self.execute("trash", request).await.map(drop))
    }

    async fn set_read(
        &self,
        credential: &ActiveCredential,
        id: &str,
        read: bool,
    ) -> Result<(), MailboxError> {
        let unread = vec!["UNREAD".to_string()];
        let payload = if read {
            ModifyMessageRequest { remove_label_ids: unread, ..Default::default() }
        } else {
            ModifyMessageRequest { add_label_ids: unread, ..Default::default() }
        };

        let request = self.client
            .post(self.url(&format!("messages/{}/modify", id)))
            .bearer_auth(credential.access_token())
            .json(&payload);
        self.execute("modify", request).await?;
        Ok(())
    }
}

/// A trash call for a message that no longer exists counts as done.
fn absorb_missing(id: &str, result: Result<(), MailboxError>) -> Result<(), MailboxError> {
    match result {
        Err(e) if e.is_not_found() => {
            warn!("Message {} already gone while trashing: {}", id, e);
            Ok(())
        }
        other => other,
    }
}

/// Plain-text RFC 2822 message with a base64 body.
pub fn build_raw_message(message: &OutgoingMessage) -> String {
    let mut body = STANDARD.encode(message.body.as_bytes());
    // 76-char lines as MIME requires
    let mut wrapped = String::with_capacity(body.len() + body.len() / 76 * 2);
    while body.len() > 76 {
        let rest = body.split_off(76);
        wrapped.push_str(&body);
        wrapped.push_str("\r\n");
        body = rest;
    }
    wrapped.push_str(&body);

    format!(
        "To: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\nContent-Transfer-Encoding: base64\r\n\r\n{}",
        sanitize_header(&message.to),
        encode_header(&message.subject),
        wrapped,
    )
}

fn sanitize_header(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

fn encode_header(value: &str) -> String {
    let clean = sanitize_header(value);
    if clean.is_ascii() {
        clean
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(clean.as_bytes()))
    }
}
