use actix_web::{get, web, HttpResponse};

use crate::error::AppError;
use crate::handlers::oauth_handler::{self, CallbackQuery};
use crate::routes::app_state::AppState;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(oauth_login)
        .service(oauth_callback);
}

#[get("/auth/login")]
async fn oauth_login(data: web::Data<AppState>) -> HttpResponse {
    oauth_handler::oauth_login(data).await
}

#[get("/auth/callback")]
async fn oauth_callback(
    data: web::Data<AppState>,
    query: web::Query<CallbackQuery>,
) -> Result<HttpResponse, AppError> {
    oauth_handler::oauth_callback(data, query.into_inner()).await
}
