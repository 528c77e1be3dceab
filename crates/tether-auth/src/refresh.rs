//! Access token refresh against the backend.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::errors::AuthError;
use crate::store::CredentialStore;

/// Tokens returned by a successful refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshedTokens {
    /// New access token.
    pub access_token: String,
    /// Rotated refresh token, when the backend issued one.
    pub refresh_token: Option<String>,
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Perform one refresh.
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, AuthError>;
}

/// Token endpoint response.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// `grant_type=refresh_token` POST to a JSON endpoint.
#[derive(Clone, Debug)]
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTokenRefresher {
    /// Refresher for `endpoint` with a default client.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    /// Refresher sharing an existing client.
    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    #[tracing::instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, AuthError> {
        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        });

        let resp = self.client.post(&self.endpoint).json(&body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AuthError::Refresh {
                status: status.as_u16(),
                message: text,
            });
        }

        let data: TokenResponse = resp.json().await?;
        debug!(rotated = data.refresh_token.is_some(), "token refreshed");
        Ok(RefreshedTokens {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
        })
    }
}

/// Refresh the credential held in `store` and write the result back.
///
/// Returns the new access token.
pub async fn refresh_stored_credential(
    refresher: &dyn TokenRefresher,
    store: &dyn CredentialStore,
) -> Result<String, AuthError> {
    let Some(refresh_token) = store.get_refresh_token()? else {
        return Err(AuthError::NotConfigured("refresh token".into()));
    };

    let tokens = refresher.refresh(&refresh_token).await?;
    store.set_token(&tokens.access_token)?;
    if let Some(rotated) = &tokens.refresh_token {
        store.set_refresh_token(rotated)?;
    }
    info!("stored credential refreshed");
    Ok(tokens.access_token)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
