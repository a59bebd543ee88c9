use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{AuthUrl, ClientId, ClientSecret, RedirectUrl, RefreshToken, RequestTokenError, TokenResponse, TokenUrl};
use uuid::Uuid;

use crate::config::GoogleOAuthConfig;
use crate::models::user::{TokenUpdate, User};
use crate::stores::{StoreError, UserStore};

/// Tokens this close to expiry are refreshed ahead of time.
const EXPIRY_SKEW_SECONDS: i64 = 60;
/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECONDS: u64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The refresh grant was rejected; the user has to sign in again.
    #[error("Reauthorization required: {0}")]
    ReauthorizationRequired(String),

    #[error("Token refresh failed: {0}")]
    Refresh(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An access token that can be used right away.
#[derive(Clone, PartialEq)]
pub struct ActiveCredential {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl ActiveCredential {
    pub fn new(access_token: String, expires_at: Option<DateTime<Utc>>) -> Self {
        ActiveCredential { access_token, expires_at }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}

impl fmt::Debug for ActiveCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveCredential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_in: Option<StdDuration>,
    /// Set when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
}

/// Exchange of a refresh token for a new access token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, CredentialError>;
}

/// Builds the Google OAuth client shared by the login flow and refreshes.
pub fn build_oauth_client(config: &GoogleOAuthConfig) -> Result<BasicClient, url::ParseError> {
    Ok(BasicClient::new(
        ClientId::new(config.client_id.clone()),
        Some(ClientSecret::new(config.client_secret.clone())),
        AuthUrl::new(config.auth_url.clone())?,
        Some(TokenUrl::new(config.token_url.clone())?),
    )
        .set_redirect_uri(RedirectUrl::new(config.redirect_uri.clone())?))
}

/// [`TokenRefresher`] backed by the `oauth2` crate.
pub struct OAuthRefresher {
    client: BasicClient,
}

impl OAuthRefresher {
    pub fn new(client: BasicClient) -> Self {
        OAuthRefresher { client }
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, CredentialError> {
        let result = self.client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await;

        match result {
            Ok(token) => Ok(RefreshedToken {
                access_token: token.access_token().secret().to_string(),
                expires_in: token.expires_in(),
                refresh_token: token.refresh_token().map(|t| t.secret().to_string()),
            }),
            Err(RequestTokenError::ServerResponse(response)) => {
                warn!("Token endpoint rejected refresh: {}", response);
                Err(CredentialError::ReauthorizationRequired(response.to_string()))
            }
            Err(e) => {
                error!("Token refresh request failed: {}", e);
                Err(CredentialError::Refresh(e.to_string()))
            }
        }
    }
}

/// Hands out usable credentials, refreshing and persisting tokens as needed.
pub struct CredentialManager {
    users: Arc<dyn UserStore>,
    refresher: Arc<dyn TokenRefresher>,
    refresh_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialManager {
    pub fn new(users: Arc<dyn UserStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
        CredentialManager {
            users,
            refresher,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a credential for `user`. An expired or missing access token is
    /// refreshed and written back to the user store before this returns.
    pub async fn obtain(&self, user: &User) -> Result<ActiveCredential, CredentialError> {
        if let Some(credential) = usable_credential(user, Utc::now()) {
            return Ok(credential);
        }

        // At most one refresh in flight per user.
        let lock = self.refresh_lock(user.id);
        let _guard = lock.lock().await;

        let current = self.users
            .get_by_id(user.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user.id)))?;
        if let Some(credential) = usable_credential(&current, Utc::now()) {
            info!("Token for user {} was refreshed by a concurrent request", user.id);
            return Ok(credential);
        }

        if current.refresh_token.trim().is_empty() {
            return Err(CredentialError::ReauthorizationRequired(
                "no refresh token stored".to_string(),
            ));
        }

        info!("Refreshing access token for user {}", user.id);
        let refreshed = self.refresher.refresh(&current.refresh_token).await?;
        let lifetime = refreshed.expires_in
            .unwrap_or(StdDuration::from_secs(DEFAULT_TOKEN_LIFETIME_SECONDS));
        let expiry = Utc::now()
            + Duration::from_std(lifetime).unwrap_or_else(|_| Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECONDS as i64));

        let update = TokenUpdate {
            access_token: Some(refreshed.access_token.clone()),
            token_expiry: Some(expiry),
            refresh_token: refreshed.refresh_token.filter(|t| !t.is_empty()),
        };
        self.users.update(user.id, update).await.map_err(|e| {
            error!("Failed to persist refreshed token for user {}: {}", user.id, e);
            CredentialError::Store(e)
        })?;
        info!("Token for user {} refreshed, valid until {}", user.id, expiry);

        Ok(ActiveCredential::new(refreshed.access_token, Some(expiry)))
    }

    fn refresh_lock(&self, user_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(user_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn usable_credential(user: &User, now: DateTime<Utc>) -> Option<ActiveCredential> {
    let token = user.access_token.as_ref().filter(|t| !t.is_empty())?;
    let expiry = user.token_expiry?;
    if expiry - Duration::seconds(EXPIRY_SKEW_SECONDS) <= now {
        return None;
    }
    Some(ActiveCredential::new(token.clone(), Some(expiry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::user::NewUser;
    use crate::stores::MemoryUserStore;

    async fn seeded_user(store: &MemoryUserStore, access: Option<&str>, expiry: Option<DateTime<Utc>>) -> User {
        store.create(NewUser {
            email: "user@example.com".to_string(),
            google_id: Uuid::new_v4().to_string(),
            refresh_token: "refresh-1".to_string(),
            access_token: access.map(str::to_string),
            token_expiry: expiry,
        }).await.unwrap()
    }

    fn refreshed(token: &str) -> RefreshedToken {
        RefreshedToken {
            access_token: token.to_string(),
            expires_in: Some(StdDuration::from_secs(3600)),
            refresh_token: None,
        }
    }

    #[tokio::test]
    async fn valid_token_makes_no_refresh_call() {
        let store = Arc::new(MemoryUserStore::new());
        let user = seeded_user(&store, Some("access-1"), Some(Utc::now() + Duration::hours(1))).await;
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh().never();

        let manager = CredentialManager::new(store.clone(), Arc::new(refresher));
        let credential = manager.obtain(&user).await.unwrap();
        assert_eq!(credential.access_token(), "access-1");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_once_and_persisted() {
        let store = Arc::new(MemoryUserStore::new());
        let old_expiry = Utc::now() - Duration::minutes(5);
        let user = seeded_user(&store, Some("stale"), Some(old_expiry)).await;
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh()
            .withf(|token| token == "refresh-1")
            .times(1)
            .returning(|_| Ok(refreshed("fresh")));

        let manager = CredentialManager::new(store.clone(), Arc::new(refresher));
        let credential = manager.obtain(&user).await.unwrap();
        assert_eq!(credential.access_token(), "fresh");

        let stored = store.get_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("fresh"));
        assert!(stored.token_expiry.unwrap() > old_expiry);
    }

    #[tokio::test]
    async fn missing_access_token_triggers_refresh() {
        let store = Arc::new(MemoryUserStore::new());
        let user = seeded_user(&store, None, None).await;
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh().times(1).returning(|_| Ok(refreshed("fresh")));

        let manager = CredentialManager::new(store.clone(), Arc::new(refresher));
        assert_eq!(manager.obtain(&user).await.unwrap().access_token(), "fresh");
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_refresh() {
        let store = Arc::new(MemoryUserStore::new());
        let user = seeded_user(&store, Some("stale"), Some(Utc::now() - Duration::hours(1))).await;
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh().times(1).returning(|_| Ok(refreshed("fresh")));

        let manager = CredentialManager::new(store.clone(), Arc::new(refresher));
        let (a, b) = tokio::join!(manager.obtain(&user), manager.obtain(&user));
        assert_eq!(a.unwrap().access_token(), "fresh");
        assert_eq!(b.unwrap().access_token(), "fresh");
    }

    #[tokio::test]
    async fn revoked_grant_surfaces_reauthorization() {
        let store = Arc::new(MemoryUserStore::new());
        let user = seeded_user(&store, None, None).await;
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh()
            .returning(|_| Err(CredentialError::ReauthorizationRequired("invalid_grant".to_string())));

        let manager = CredentialManager::new(store.clone(), Arc::new(refresher));
        let err = manager.obtain(&user).await.unwrap_err();
        assert!(matches!(err, CredentialError::ReauthorizationRequired(_)));
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_stored() {
        let store = Arc::new(MemoryUserStore::new());
        let user = seeded_user(&store, None, None).await;
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh().returning(|_| Ok(RefreshedToken {
            access_token: "fresh".to_string(),
            expires_in: None,
            refresh_token: Some("refresh-2".to_string()),
        }));

        let manager = CredentialManager::new(store.clone(), Arc::new(refresher));
        let credential = manager.obtain(&user).await.unwrap();
        assert!(credential.expires_at().unwrap() > Utc::now() + Duration::minutes(59));

        let stored = store.get_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token, "refresh-2");
    }
}
