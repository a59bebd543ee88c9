pub mod chat_service;
pub mod credential_service;
pub mod gmail_service;
pub mod intent_service;
pub mod llm_service;
pub mod message_parser;
