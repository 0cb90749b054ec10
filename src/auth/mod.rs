use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::connectors::gmail_api::redact_response_body;

pub mod token_store;

pub use token_store::{EncryptedFileTokenStore, MemoryTokenStore, TokenStore};

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CACHE_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no refresh token stored for account {0} (run `mailmirror auth set-token`)")]
    MissingRefreshToken(String),

    #[error("client secrets: {0}")]
    ClientSecrets(String),

    #[error("token request failed: status={status} body={body}")]
    TokenEndpoint { status: StatusCode, body: String },

    #[error("token request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("token store crypto: {0}")]
    Crypto(String),

    #[error("token store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("token json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("token store lock poisoned")]
    Poisoned,
}

/// Hands out a bearer credential that is valid right now.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn current_credential(&self) -> Result<String, AuthError>;
}

/// A pre-issued access token, used as is.
#[derive(Debug, Clone)]
pub struct StaticCredential(String);

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn current_credential(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

/// OAuth client identity from Google's `credentials.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    pub token_uri: String,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecretsSection>,
    web: Option<ClientSecretsSection>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsSection {
    client_id: Option<String>,
    client_secret: Option<String>,
    token_uri: Option<String>,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        if !path.exists() {
            return Err(AuthError::ClientSecrets(format!(
                "Google credentials not found at {}; download credentials.json from Google Cloud Console",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, AuthError> {
        let file: ClientSecretsFile = serde_json::from_str(raw)?;
        let section = file.installed.or(file.web).ok_or_else(|| {
            AuthError::ClientSecrets("expected an 'installed' or 'web' section".to_string())
        })?;

        let non_empty = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let client_id = non_empty(section.client_id);
        let client_secret = non_empty(section.client_secret);
        let (Some(client_id), Some(client_secret)) = (client_id, client_secret) else {
            return Err(AuthError::ClientSecrets(
                "missing client_id or client_secret".to_string(),
            ));
        };

        Ok(Self {
            client_id,
            client_secret,
            token_uri: non_empty(section.token_uri).unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: u64,
    scope: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedAccessToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedAccessToken {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Exchanges the account's stored refresh token for short-lived access
/// tokens, caching each one in memory until shortly before it expires.
pub struct OAuthCredentialProvider {
    client: Client,
    secrets: ClientSecrets,
    account: String,
    store: Arc<dyn TokenStore>,
    cache: Mutex<Option<CachedAccessToken>>,
}

impl OAuthCredentialProvider {
    pub fn new(secrets: ClientSecrets, account: impl Into<String>, store: Arc<dyn TokenStore>) -> Self {
        Self {
            client: Client::new(),
            secrets,
            account: account.into(),
            store,
            cache: Mutex::new(None),
        }
    }

    async fn fetch_token(&self, refresh_token: &str) -> Result<OAuthTokenResponse, AuthError> {
        let response = self
            .client
            .post(&self.secrets.token_uri)
            .form(&[
                ("client_id", self.secrets.client_id.as_str()),
                ("client_secret", self.secrets.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::TokenEndpoint {
                status,
                body: redact_response_body(&body),
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl CredentialProvider for OAuthCredentialProvider {
    async fn current_credential(&self) -> Result<String, AuthError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref().filter(|cached| !cached.is_expired()) {
            return Ok(cached.access_token.clone());
        }

        let refresh_token = self
            .store
            .refresh_token(&self.account)?
            .ok_or_else(|| AuthError::MissingRefreshToken(self.account.clone()))?;

        debug!("refreshing access token for {}", self.account);
        let payload = self.fetch_token(&refresh_token).await?;

        if let Some(rotated) = payload
            .refresh_token
            .as_deref()
            .filter(|rotated| !rotated.is_empty() && *rotated != refresh_token)
        {
            info!("storing rotated refresh token for {}", self.account);
            self.store.set_refresh_token(&self.account, rotated)?;
        }

        let expires_at = Utc::now()
            + Duration::seconds((payload.expires_in as i64).saturating_sub(CACHE_SKEW_SECONDS));
        let access_token = payload.access_token;
        *cache = Some(CachedAccessToken {
            access_token: access_token.clone(),
            expires_at,
        });
        Ok(access_token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use super::{
        AuthError, CachedAccessToken, ClientSecrets, CredentialProvider, MemoryTokenStore,
        OAuthCredentialProvider, OAuthTokenResponse, StaticCredential, GOOGLE_TOKEN_URL,
    };

    #[test]
    fn oauth_token_response_deserializes() {
        let payload = r#"{"access_token":"ya29.abc","token_type":"Bearer","expires_in":3600,"scope":"https://www.googleapis.com/auth/gmail.modify"}"#;
        let decoded: OAuthTokenResponse =
            serde_json::from_str(payload).expect("decode oauth token response");
        assert_eq!(decoded.access_token, "ya29.abc");
        assert_eq!(decoded.expires_in, 3600);
        assert!(decoded.refresh_token.is_none());
    }

    #[test]
    fn cached_token_expiry() {
        let fresh = CachedAccessToken {
            access_token: "t".to_string(),
            expires_at: Utc::now() + Duration::minutes(5),
        };
        let stale = CachedAccessToken {
            access_token: "t".to_string(),
            expires_at: Utc::now() - Duration::seconds(1),
        };
        assert!(!fresh.is_expired());
        assert!(stale.is_expired());
    }

    #[test]
    fn client_secrets_read_installed_section() {
        let raw = r#"{"installed":{"client_id":"id-1","client_secret":"secret-1","token_uri":"https://oauth2.googleapis.com/token"}}"#;
        let secrets = ClientSecrets::from_json(raw).expect("parse secrets");
        assert_eq!(secrets.client_id, "id-1");
        assert_eq!(secrets.client_secret, "secret-1");
    }

    #[test]
    fn client_secrets_fall_back_to_web_section_and_default_token_uri() {
        let raw = r#"{"web":{"client_id":"id-2","client_secret":"secret-2"}}"#;
        let secrets = ClientSecrets::from_json(raw).expect("parse secrets");
        assert_eq!(secrets.client_id, "id-2");
        assert_eq!(secrets.token_uri, GOOGLE_TOKEN_URL);
    }

    #[test]
    fn client_secrets_reject_missing_fields() {
        assert!(matches!(
            ClientSecrets::from_json(r#"{"other":{}}"#),
            Err(AuthError::ClientSecrets(_))
        ));
        assert!(matches!(
            ClientSecrets::from_json(r#"{"installed":{"client_id":"id"}}"#),
            Err(AuthError::ClientSecrets(_))
        ));
    }

    #[tokio::test]
    async fn static_credential_returns_its_token() {
        let provider = StaticCredential::new("fixed-token");
        assert_eq!(
            provider.current_credential().await.expect("credential"),
            "fixed-token"
        );
    }

    #[tokio::test]
    async fn oauth_provider_requires_a_stored_refresh_token() {
        let secrets = ClientSecrets {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            token_uri: GOOGLE_TOKEN_URL.to_string(),
        };
        let provider = OAuthCredentialProvider::new(
            secrets,
            "user@example.com",
            Arc::new(MemoryTokenStore::default()),
        );

        let err = provider
            .current_credential()
            .await
            .expect_err("no refresh token stored");
        assert!(matches!(err, AuthError::MissingRefreshToken(account) if account == "user@example.com"));
    }
}
