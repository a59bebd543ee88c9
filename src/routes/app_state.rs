use std::sync::Arc;
use oauth2::basic::BasicClient;

use crate::services::chat_service::ChatService;
use crate::stores::UserStore;

/// Shared state handed to every request handler.
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub users: Arc<dyn UserStore>,
    pub oauth: BasicClient,
    pub userinfo_url: String,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(
        chat: Arc<ChatService>,
        users: Arc<dyn UserStore>,
        oauth: BasicClient,
        userinfo_url: String,
    ) -> Self {
        AppState {
            chat,
            users,
            oauth,
            userinfo_url,
            http: reqwest::Client::new(),
        }
    }
}
