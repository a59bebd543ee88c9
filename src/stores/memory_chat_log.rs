use std::collections::HashMap;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::chat_turn::{ChatTurn, Metadata, Role};
use crate::stores::{ConversationLog, StoreError};

/// Conversation log held in memory, one vector per user in append order.
#[derive(Default)]
pub struct MemoryChatLog {
    turns: Mutex<HashMap<Uuid, Vec<ChatTurn>>>,
}

impl MemoryChatLog {
    pub fn new() -> Self {
        MemoryChatLog {
            turns: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ConversationLog for MemoryChatLog {
    async fn append(
        &self,
        user_id: Uuid,
        role: Role,
        content: String,
        metadata: Option<Metadata>,
    ) -> Result<ChatTurn, StoreError> {
        let mut turns = self.turns.lock().await;
        let history = turns.entry(user_id).or_default();

        // Timestamps never go backwards within one user's log.
        let mut created_at = Utc::now();
        if let Some(last) = history.last() {
            if created_at < last.created_at {
                created_at = last.created_at;
            }
        }

        let turn = ChatTurn {
            user_id,
            role,
            content,
            metadata,
            created_at,
        };
        history.push(turn.clone());
        Ok(turn)
    }

    async fn recent(&self, user_id: Uuid, limit: usize) -> Result<Vec<ChatTurn>, StoreError> {
        let turns = self.turns.lock().await;
        let Some(history) = turns.get(&user_id) else {
            return Ok(Vec::new());
        };

        // Newest first, then flipped back to chronological order.
        let mut window: Vec<ChatTurn> = history.iter().rev().take(limit).cloned().collect();
        window.reverse();
        Ok(window)
    }
}
