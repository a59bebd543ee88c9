pub mod memory_chat_log;
pub mod memory_user_store;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::chat_turn::{ChatTurn, Metadata, Role};
use crate::models::user::{NewUser, TokenUpdate, User};

pub use memory_chat_log::MemoryChatLog;
pub use memory_user_store::MemoryUserStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Failed to create user: {0}")]
    CreateFailed(String),

    #[error("Failed to update user: {0}")]
    UpdateFailed(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),
}

/// Point lookups and token updates on user rows.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn get_by_google_id(&self, google_id: &str) -> Result<Option<User>, StoreError>;
    async fn create(&self, draft: NewUser) -> Result<User, StoreError>;
    async fn update(&self, id: Uuid, update: TokenUpdate) -> Result<User, StoreError>;
}

/// Append-only store of chat turns.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationLog: Send + Sync {
    async fn append(
        &self,
        user_id: Uuid,
        role: Role,
        content: String,
        metadata: Option<Metadata>,
    ) -> Result<ChatTurn, StoreError>;

    /// The `limit` most recent turns, oldest first.
    async fn recent(&self, user_id: Uuid, limit: usize) -> Result<Vec<ChatTurn>, StoreError>;
}
