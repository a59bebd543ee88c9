use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;

use crate::services::credential_service::CredentialError;
use crate::services::gmail_service::MailboxError;
use crate::services::llm_service::AssistantError;
use crate::stores::StoreError;

/// Failure categories surfaced past the orchestrator boundary.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Reauthorization required: {0}")]
    ReauthorizationRequired(String),

    #[error(transparent)]
    MailboxFailed(#[from] MailboxError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable tag for callers that branch on the category.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::NotFound(_) => "not_found",
            AppError::ReauthorizationRequired(_) => "reauthorization_required",
            AppError::MailboxFailed(_) => "mailbox_operation_failed",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Text shown to the user and persisted as the assistant turn.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Validation(msg) => format!("Error: {}", msg),
            AppError::NotFound(msg) => format!("Error: {}", msg),
            AppError::ReauthorizationRequired(_) => {
                "Your Gmail access has expired or was revoked. Please sign in again to continue.".to_string()
            }
            AppError::MailboxFailed(e) => format!("Failed to process message: {}", e),
            AppError::Internal(_) => {
                "Failed to process message: something went wrong on our side. Please try again.".to_string()
            }
        }
    }
}

impl From<CredentialError> for AppError {
    fn from(error: CredentialError) -> Self {
        match error {
            CredentialError::ReauthorizationRequired(msg) => AppError::ReauthorizationRequired(msg),
            CredentialError::Refresh(msg) => AppError::Internal(format!("token refresh failed: {}", msg)),
            CredentialError::Store(e) => AppError::from(e),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(msg) => AppError::NotFound(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<AssistantError> for AppError {
    fn from(error: AssistantError) -> Self {
        AppError::Internal(error.to_string())
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ReauthorizationRequired(_) => StatusCode::UNAUTHORIZED,
            AppError::MailboxFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.kind(),
            "detail": self.user_message(),
        }))
    }
}
