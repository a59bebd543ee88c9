pub mod chat_turn;
pub mod email;
pub mod gmail_message;
pub mod intent;
pub mod orchestration;
pub mod user;
