use actix_web::{web, HttpResponse};
use chrono::Utc;
use log::{error, info, warn};
use oauth2::reqwest::async_http_client;
use oauth2::{AuthorizationCode, CsrfToken, RequestTokenError, Scope, TokenResponse};
use serde::Deserialize;
use serde_json::json;

use crate::config::GOOGLE_SCOPES;
use crate::error::AppError;
use crate::models::user::{NewUser, TokenUpdate, User};
use crate::routes::app_state::AppState;

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// The subset of the Google userinfo response we need.
#[derive(Debug, Deserialize)]
pub struct GoogleUserInfo {
    pub sub: String,
    pub email: String,
}

/// Tokens returned by a successful code exchange.
#[derive(Debug)]
pub struct GrantedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<std::time::Duration>,
}

/// Builds the consent URL. Offline access with a forced consent prompt makes
/// Google return a refresh token on every login.
pub async fn oauth_login(data: web::Data<AppState>) -> HttpResponse {
    let (auth_url, csrf_token) = GOOGLE_SCOPES.iter()
        .fold(data.oauth.authorize_url(CsrfToken::new_random), |request, scope| {
            request.add_scope(Scope::new(scope.to_string()))
        })
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent")
        .url();

    HttpResponse::Ok().json(json!({
        "authorization_url": auth_url.to_string(),
        "state": csrf_token.secret(),
    }))
}

pub async fn oauth_callback(
    data: web::Data<AppState>,
    query: CallbackQuery,
) -> Result<HttpResponse, AppError> {
    if let Some(reason) = query.error {
        warn!("Google returned an authorization error: {}", reason);
        return Err(AppError::Validation(format!("Authorization was not granted: {}", reason)));
    }
    let code = query.code
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| AppError::Validation("Missing code".to_string()))?;

    let tokens = exchange_code(&data, code).await?;
    let info = fetch_userinfo(&data, &tokens.access_token).await?;
    let user = upsert_user(&data, &info, tokens).await?;
    info!("User {} signed in", user.id);

    Ok(HttpResponse::Ok().json(json!({
        "user_id": user.id,
        "email": user.email,
    })))
}

async fn exchange_code(data: &AppState, code: String) -> Result<GrantedTokens, AppError> {
    let result = data.oauth
        .exchange_code(AuthorizationCode::new(code))
        .request_async(async_http_client)
        .await;

    match result {
        Ok(token) => Ok(GrantedTokens {
            access_token: token.access_token().secret().to_string(),
            refresh_token: token.refresh_token().map(|t| t.secret().to_string()),
            expires_in: token.expires_in(),
        }),
        Err(RequestTokenError::ServerResponse(response)) => {
            warn!("Token endpoint rejected the authorization code: {}", response);
            Err(AppError::Validation("The authorization code was rejected".to_string()))
        }
        Err(e) => {
            error!("Token exchange error: {:?}", e);
            Err(AppError::Internal(format!("token exchange failed: {}", e)))
        }
    }
}

async fn fetch_userinfo(data: &AppState, access_token: &str) -> Result<GoogleUserInfo, AppError> {
    let response = data.http
        .get(&data.userinfo_url)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| AppError::Internal(format!("userinfo request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::Internal(format!("userinfo returned {}", response.status())));
    }
    response.json::<GoogleUserInfo>()
        .await
        .map_err(|e| AppError::Internal(format!("userinfo response unreadable: {}", e)))
}

/// Creates the user on first login. Later logins only replace tokens; a
/// missing refresh token keeps the stored one.
pub async fn upsert_user(
    data: &AppState,
    info: &GoogleUserInfo,
    tokens: GrantedTokens,
) -> Result<User, AppError> {
    let token_expiry = tokens.expires_in
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| Utc::now() + d);

    match data.users.get_by_google_id(&info.sub).await? {
        Some(existing) => Ok(data.users
            .update(existing.id, TokenUpdate {
                refresh_token: tokens.refresh_token,
                access_token: Some(tokens.access_token),
                token_expiry,
            })
            .await?),
        None => {
            let refresh_token = tokens.refresh_token.ok_or_else(|| AppError::Validation(
                "Google did not return a refresh token. Remove the app's access from your Google account and sign in again.".to_string(),
            ))?;
            Ok(data.users
                .create(NewUser {
                    email: info.email.clone(),
                    google_id: info.sub.clone(),
                    refresh_token,
                    access_token: Some(tokens.access_token),
                    token_expiry,
                })
                .await?)
        }
    }
}
