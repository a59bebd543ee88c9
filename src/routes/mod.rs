pub mod app_state;
pub mod chat_routes;
pub mod health_routes;
pub mod oauth_routes;

use actix_web::web;

use crate::error::AppError;

/// Registers every route plus the JSON body error mapping.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        AppError::Validation(format!("Invalid request body: {}", err)).into()
    }))
        .app_data(web::QueryConfig::default().error_handler(|err, _req| {
            AppError::Validation(format!("Invalid query string: {}", err)).into()
        }));
    chat_routes::init_routes(cfg);
    oauth_routes::init_routes(cfg);
    health_routes::init_routes(cfg);
}
