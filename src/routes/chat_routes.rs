use actix_web::{get, post, web, HttpResponse};

use crate::error::AppError;
use crate::handlers::chat_handler::{self, ChatRequest, HistoryQuery, UserQuery};
use crate::routes::app_state::AppState;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(chat_message)
        .service(chat_history);
}

#[post("/chat/message")]
async fn chat_message(
    data: web::Data<AppState>,
    query: web::Query<UserQuery>,
    req_body: web::Json<ChatRequest>,
) -> Result<HttpResponse, AppError> {
    chat_handler::handle_chat_message(data, query.into_inner(), req_body.into_inner()).await
}

#[get("/chat/history")]
async fn chat_history(
    data: web::Data<AppState>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    chat_handler::handle_chat_history(data, query.into_inner()).await
}
