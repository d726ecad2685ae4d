//! Token issuer trait for pluggable authentication backends

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Authentication errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid authentication configuration: {0}")]
    InvalidConfig(String),

    #[error("Authentication request failed: {0}")]
    RequestFailed(String),

    #[error("Authentication service rejected credentials (status {0})")]
    Rejected(u16),

    #[error("Authentication response did not include a token")]
    MissingToken,
}

/// Username/password pair scoped to a project
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub project_id: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            project_id: project_id.into(),
        }
    }
}

// Keep the password out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("project_id", &self.project_id)
            .finish()
    }
}

/// Issues bearer tokens from credentials
///
/// # Example
///
/// ```ignore
/// use mwproxy_auth::{async_trait, AuthError, Credentials, TokenIssuer};
///
/// struct FixedIssuer(String);
///
/// #[async_trait]
/// impl TokenIssuer for FixedIssuer {
///     async fn issue_token(&self, _credentials: &Credentials) -> Result<String, AuthError> {
///         Ok(self.0.clone())
///     }
/// }
/// ```
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Obtain a new project-scoped token
    async fn issue_token(&self, credentials: &Credentials) -> Result<String, AuthError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("admin", "hunter2", "project-1");
        let debug = format!("{:?}", creds);

        assert!(debug.contains("admin"));
        assert!(debug.contains("project-1"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_auth_error_display() {
        assert!(AuthError::Rejected(401).to_string().contains("401"));
        assert!(AuthError::MissingToken.to_string().contains("token"));
    }
}
