use std::io;
use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use log::{error, info};

use inbox_chat_agent::config::{init_logging, AppConfig};
use inbox_chat_agent::routes::{self, app_state::AppState};
use inbox_chat_agent::services::chat_service::ChatService;
use inbox_chat_agent::services::credential_service::{build_oauth_client, CredentialManager, OAuthRefresher};
use inbox_chat_agent::services::gmail_service::GmailClient;
use inbox_chat_agent::services::llm_service::OllamaAssistant;
use inbox_chat_agent::stores::{ConversationLog, MemoryChatLog, MemoryUserStore, UserStore};

fn startup_error(context: &str, err: impl std::fmt::Display) -> io::Error {
    error!("{}: {}", context, err);
    io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", context, err))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    init_logging();

    let config = AppConfig::from_env().map_err(|e| startup_error("Invalid configuration", format!("{:#}", e)))?;
    let oauth = build_oauth_client(&config.google).map_err(|e| startup_error("Invalid OAuth endpoint", e))?;
    let mailbox = GmailClient::new(&config.gmail_api_base, config.mailbox_timeout)
        .map_err(|e| startup_error("Could not build mailbox client", e))?;

    let users: Arc<dyn UserStore> = Arc::new(MemoryUserStore::new());
    let log: Arc<dyn ConversationLog> = Arc::new(MemoryChatLog::new());
    let credentials = Arc::new(CredentialManager::new(
        users.clone(),
        Arc::new(OAuthRefresher::new(oauth.clone())),
    ));
    let assistant = Arc::new(OllamaAssistant::new(&config.ollama));
    info!("Using model {} at {}:{}", config.ollama.model, config.ollama.host, config.ollama.port);

    let chat = Arc::new(ChatService::new(
        users.clone(),
        log,
        credentials,
        Arc::new(mailbox),
        assistant,
        config.orchestrator.clone(),
    ));
    let state = web::Data::new(AppState::new(chat, users, oauth, config.google.userinfo_url.clone()));

    info!("Starting server on http://{}:{}", config.api_host, config.api_port);
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(state.clone())
            .configure(routes::configure)
    })
        .bind((config.api_host.as_str(), config.api_port))?
        .run()
        .await
}
