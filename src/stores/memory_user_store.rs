use std::collections::HashMap;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::user::{NewUser, TokenUpdate, User};
use crate::stores::{StoreError, UserStore};

/// In-process user table keyed by id, unique on `google_id`.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        MemoryUserStore {
            users: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let users = self.users.read().await;
        Ok(users.get(&id).cloned())
    }

    async fn get_by_google_id(&self, google_id: &str) -> Result<Option<User>, StoreError> {
        let users = self.users.read().await;
        Ok(users.values().find(|u| u.google_id == google_id).cloned())
    }

    async fn create(&self, draft: NewUser) -> Result<User, StoreError> {
        if draft.google_id.trim().is_empty() {
            return Err(StoreError::CreateFailed("google id is empty".to_string()));
        }

        let mut users = self.users.write().await;
        if users.values().any(|u| u.google_id == draft.google_id) {
            return Err(StoreError::Duplicate(format!("user with google id {}", draft.google_id)));
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: draft.email,
            google_id: draft.google_id,
            access_token: draft.access_token,
            refresh_token: draft.refresh_token,
            token_expiry: draft.token_expiry,
            created_at: now,
            updated_at: now,
        };
        users.insert(user.id, user.clone());
        info!("Created user {}", user.id);
        Ok(user)
    }

    async fn update(&self, id: Uuid, update: TokenUpdate) -> Result<User, StoreError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id)
            .ok_or_else(|| StoreError::UpdateFailed(format!("no user with id {}", id)))?;

        if let Some(refresh_token) = update.refresh_token {
            user.refresh_token = refresh_token;
        }
        if let Some(access_token) = update.access_token {
            user.access_token = Some(access_token);
        }
        if let Some(expiry) = update.token_expiry {
            user.token_expiry = Some(expiry);
        }
        user.updated_at = Utc::now();
        debug!("Updated tokens for user {}", id);
        Ok(user.clone())
    }
}
