use actix_web::{web, HttpResponse};
use log::info;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::routes::app_state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub user_id: String,
    pub limit: Option<usize>,
}

pub fn parse_user_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::Validation(format!("'{}' is not a valid user id", raw)))
}

pub async fn handle_chat_message(
    data: web::Data<AppState>,
    query: UserQuery,
    request: ChatRequest,
) -> Result<HttpResponse, AppError> {
    let user_id = parse_user_id(&query.user_id)?;
    if request.message.trim().is_empty() {
        return Err(AppError::Validation("Message must not be empty".to_string()));
    }

    let result = data.chat.process_message(user_id, &request.message).await?;
    info!("Chat turn for user {} finished with {:?}", user_id, result.action_taken);
    Ok(HttpResponse::Ok().json(result))
}

pub async fn handle_chat_history(
    data: web::Data<AppState>,
    query: HistoryQuery,
) -> Result<HttpResponse, AppError> {
    let user_id = parse_user_id(&query.user_id)?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_HISTORY_LIMIT
        )));
    }

    let turns = data.chat.history(user_id, limit).await?;
    Ok(HttpResponse::Ok().json(turns))
}
