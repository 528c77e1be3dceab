//! Best-effort backend logout.

use async_trait::async_trait;

use crate::errors::AuthError;

/// Tells the backend a session has ended.
#[async_trait]
pub trait LogoutBackend: Send + Sync {
    /// Revoke the session identified by `token`.
    async fn logout(&self, token: &str) -> Result<(), AuthError>;
}

/// Bearer-authenticated `POST` to a logout endpoint.
#[derive(Clone, Debug)]
pub struct HttpLogoutBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLogoutBackend {
    /// Backend for `endpoint` with a default client.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    /// Backend sharing an existing client.
    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl LogoutBackend for HttpLogoutBackend {
    #[tracing::instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn logout(&self, token: &str) -> Result<(), AuthError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AuthError::Logout {
                status: status.as_u16(),
                message: text,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn logout_sends_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/logout"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpLogoutBackend::new(format!("{}/auth/logout", server.uri()));
        backend.logout("tok-1").await.unwrap();
    }

    #[tokio::test]
    async fn logout_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let err = HttpLogoutBackend::new(server.uri())
            .logout("tok-1")
            .await
            .unwrap_err();
        assert_matches!(err, AuthError::Logout { status: 502, .. });
        assert_eq!(err.category(), tether_core::ErrorCategory::Network);
    }
}
