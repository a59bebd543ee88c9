pub mod chat_handler;
pub mod oauth_handler;
