//! Keystone v3 password authentication
//!
//! Tokens are requested with `POST <auth-url>/v3/auth/tokens` and returned in
//! the `X-Subject-Token` response header.

use crate::issuer::{AuthError, Credentials, TokenIssuer};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Header carrying the issued token
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// Keystone client configuration
#[derive(Debug, Clone)]
pub struct KeystoneConfig {
    /// Keystone endpoint (with or without a trailing `/v3`)
    pub url: String,
    /// Request timeout
    pub timeout: Duration,
    /// Domain the user belongs to
    pub user_domain: String,
}

impl KeystoneConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(30),
            user_domain: "default".to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_domain(mut self, domain: impl Into<String>) -> Self {
        self.user_domain = domain.into();
        self
    }
}

/// Keystone-backed token issuer
#[derive(Debug, Clone)]
pub struct KeystoneClient {
    http: reqwest::Client,
    tokens_url: String,
    user_domain: String,
}

impl KeystoneClient {
    /// Build a client; fails if the URL is empty or the HTTP client can't be built
    pub fn new(config: KeystoneConfig) -> Result<Self, AuthError> {
        let base = config.url.trim_end_matches('/');
        if base.is_empty() {
            return Err(AuthError::InvalidConfig(
                "Keystone URL cannot be empty".to_string(),
            ));
        }

        let tokens_url = if base.ends_with("/v3") {
            format!("{}/auth/tokens", base)
        } else {
            format!("{}/v3/auth/tokens", base)
        };

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AuthError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            http,
            tokens_url,
            user_domain: config.user_domain,
        })
    }

    pub fn tokens_url(&self) -> &str {
        &self.tokens_url
    }

    fn request_body(&self, credentials: &Credentials) -> serde_json::Value {
        json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": credentials.username,
                            "domain": { "id": self.user_domain },
                            "password": credentials.password,
                        }
                    }
                },
                "scope": {
                    "project": { "id": credentials.project_id }
                }
            }
        })
    }
}

#[async_trait]
impl TokenIssuer for KeystoneClient {
    async fn issue_token(&self, credentials: &Credentials) -> Result<String, AuthError> {
        debug!(
            url = %self.tokens_url,
            username = %credentials.username,
            project_id = %credentials.project_id,
            "Requesting project token"
        );

        let response = self
            .http
            .post(&self.tokens_url)
            .json(&self.request_body(credentials))
            .send()
            .await
            .map_err(|e| AuthError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected(status.as_u16()));
        }

        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(AuthError::MissingToken)?;

        debug!(status = status.as_u16(), "Project token issued");
        Ok(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_url() {
        let client = KeystoneClient::new(KeystoneConfig::new("https://ks.example.com/keystone"))
            .unwrap();
        assert_eq!(
            client.tokens_url(),
            "https://ks.example.com/keystone/v3/auth/tokens"
        );

        let client = KeystoneClient::new(KeystoneConfig::new("https://ks.example.com/v3/")).unwrap();
        assert_eq!(client.tokens_url(), "https://ks.example.com/v3/auth/tokens");
    }

    #[test]
    fn test_empty_url_rejected() {
        let result = KeystoneClient::new(KeystoneConfig::new("/"));
        assert!(matches!(result, Err(AuthError::InvalidConfig(_))));
    }

    #[test]
    fn test_request_body_is_project_scoped() {
        let client = KeystoneClient::new(
            KeystoneConfig::new("http://localhost:5000").with_user_domain("corp"),
        )
        .unwrap();
        let body = client.request_body(&Credentials::new("alice", "secret", "p-42"));

        assert_eq!(body["auth"]["identity"]["methods"][0], "password");
        assert_eq!(body["auth"]["identity"]["password"]["user"]["name"], "alice");
        assert_eq!(
            body["auth"]["identity"]["password"]["user"]["domain"]["id"],
            "corp"
        );
        assert_eq!(body["auth"]["scope"]["project"]["id"], "p-42");
    }
}
