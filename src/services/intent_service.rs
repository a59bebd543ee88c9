use std::sync::Arc;
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;

use crate::models::chat_turn::{ChatTurn, Role};
use crate::models::intent::{Intent, IntentResult, Slots};
use crate::models::orchestration::ActionTag;
use crate::services::llm_service::{Assistant, AssistantError};

lazy_static! {
    // Both patterns must cover the whole reply: one confirmation word, then
    // only politeness or a restatement of the pending action.
    static ref AFFIRMATIVE: Regex = Regex::new(
        r"(?i)^\s*(yes|yeah|yep|yup|sure|ok|okay|confirm(ed)?|do it|go ahead|please do|send it|delete it)(\s*,?\s*(please|thanks|thank you|yes|do it|go ahead|send it|delete it))*\s*[.!]*\s*$"
    ).unwrap();
    static ref NEGATIVE: Regex = Regex::new(
        r"(?i)^\s*(no|nope|nah|cancel|don'?t|do not|stop|never ?mind|keep it)(\s*,?\s*(thanks|thank you|please|cancel|keep it|never ?mind|(don'?t|do not) (send|delete) it))*\s*[.!]*\s*$"
    ).unwrap();
}

/// A bare yes/no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Affirm,
    Decline,
}

/// Reads bare replies like "yes delete it" or "no thanks". Anything that
/// says more than yes or no is left to the classifier.
pub fn classify_confirmation(text: &str) -> Option<Confirmation> {
    if NEGATIVE.is_match(text) {
        Some(Confirmation::Decline)
    } else if AFFIRMATIVE.is_match(text) {
        Some(Confirmation::Affirm)
    } else {
        None
    }
}

/// The action the last assistant turn left waiting for a yes or no.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingAction {
    Delete { email_id: String },
    Send(Slots),
}

/// Looks at the trailing assistant turn only; older prompts have expired.
pub fn pending_action(history: &[ChatTurn]) -> Option<PendingAction> {
    let last = history.iter().rev().find(|turn| turn.role == Role::Assistant)?;
    match last.action()? {
        a if a == ActionTag::DeleteConfirm.as_str() => {
            let email_id = last.metadata_str("email_id")?.to_string();
            Some(PendingAction::Delete { email_id })
        }
        a if a == ActionTag::GenerateReply.as_str() => Some(PendingAction::Send(Slots {
            email_id: last.metadata_str("email_id").map(str::to_string),
            reply_text: last.metadata_str("reply_text").map(str::to_string),
            to: last.metadata_str("to").map(str::to_string),
            subject: last.metadata_str("subject").map(str::to_string),
            thread_id: last.metadata_str("thread_id").map(str::to_string),
            ..Default::default()
        })),
        _ => None,
    }
}

/// Maps chat text plus recent history to an intent with slots.
///
/// Classification itself is delegated to the [`Assistant`]; this type owns
/// confirmation carry-over and the filling of reply slots from history.
/// Ordinal references are left as `email_index` for the orchestrator to
/// resolve against a fresh listing.
pub struct IntentResolver {
    assistant: Arc<dyn Assistant>,
}

impl IntentResolver {
    pub fn new(assistant: Arc<dyn Assistant>) -> Self {
        IntentResolver { assistant }
    }

    /// `history` must be chronological and exclude the current message.
    pub async fn resolve(&self, text: &str, history: &[ChatTurn]) -> Result<IntentResult, AssistantError> {
        let pending = pending_action(history);

        if let (Some(pending), Some(answer)) = (&pending, classify_confirmation(text)) {
            let result = answer_pending(pending, answer);
            info!("Resolved '{}' against pending action as {:?}", text, result.intent);
            return Ok(result);
        }

        let mut result = self.assistant.detect_intent(text, history).await?;
        debug!("Classifier returned {:?}", result);

        match (&result.intent, &pending) {
            (Intent::SendReply, Some(PendingAction::Send(carried))) => {
                fill_missing(&mut result.slots, carried);
            }
            (Intent::DeleteEmail, Some(PendingAction::Delete { email_id }))
                if result.slots.confirmed == Some(true)
                    && result.slots.email_id.is_none()
                    && result.slots.email_index.is_none() =>
            {
                result.slots.email_id = Some(email_id.clone());
            }
            _ => {}
        }
        Ok(result)
    }
}

fn answer_pending(pending: &PendingAction, answer: Confirmation) -> IntentResult {
    let confirmed = Some(answer == Confirmation::Affirm);
    match pending {
        PendingAction::Delete { email_id } => IntentResult::with_slots(Intent::DeleteEmail, Slots {
            email_id: Some(email_id.clone()),
            confirmed,
            ..Default::default()
        }),
        PendingAction::Send(slots) => IntentResult::with_slots(Intent::SendReply, Slots {
            confirmed,
            ..slots.clone()
        }),
    }
}

fn fill_missing(slots: &mut Slots, carried: &Slots) {
    if slots.reply_text.is_none() {
        slots.reply_text = carried.reply_text.clone();
    }
    if slots.to.is_none() {
        slots.to = carried.to.clone();
    }
    if slots.subject.is_none() {
        slots.subject = carried.subject.clone();
    }
    if slots.thread_id.is_none() {
        slots.thread_id = carried.thread_id.clone();
    }
    if slots.email_id.is_none() {
        slots.email_id = carried.email_id.clone();
    }
}
