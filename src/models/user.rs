use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A mailbox owner. Only the token fields change after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub google_id: String,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    pub token_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub google_id: String,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
}

/// Token fields to overwrite. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenUpdate {
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
}

impl TokenUpdate {
    pub fn is_empty(&self) -> bool {
        self.refresh_token.is_none() && self.access_token.is_none() && self.token_expiry.is_none()
    }
}
