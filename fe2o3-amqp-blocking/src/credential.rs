//! Token credential capability consumed by audience authentication

use std::{
    error::Error as StdError,
    fmt,
    time::{Duration, SystemTime},
};

use crate::{constants::JWT_TOKEN_TYPE, context::Context};

/// A bearer token together with its expiry
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// The token
    pub token: String,

    /// When the token expires
    pub expires_on: SystemTime,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

impl AccessToken {
    /// Creates a new token
    pub fn new(token: impl Into<String>, expires_on: SystemTime) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    /// Whether the token expires within `margin` from now
    pub fn expires_within(&self, margin: Duration) -> bool {
        match self.expires_on.duration_since(SystemTime::now()) {
            Ok(remaining) => remaining <= margin,
            Err(_) => true,
        }
    }
}

/// Parameters of a token request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRequestContext {
    /// The scopes the token is requested for
    pub scopes: Vec<String>,
}

/// Failure to obtain a token
#[derive(Debug, thiserror::Error)]
#[error("Failed to obtain an access token: {message}")]
pub struct CredentialError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl CredentialError {
    /// Creates a new error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new error wrapping an underlying cause
    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Produces bearer tokens for a set of scopes
pub trait TokenCredential: Send + Sync {
    /// Obtains a token, which may block
    fn get_token(
        &self,
        request: &TokenRequestContext,
        context: &Context,
    ) -> Result<AccessToken, CredentialError>;

    /// The token type presented to the claims-based security node
    fn token_type(&self) -> &str {
        JWT_TOKEN_TYPE
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::AccessToken;

    #[test]
    fn token_expiring_inside_margin_needs_refresh() {
        let token = AccessToken::new("t", SystemTime::now() + Duration::from_secs(60));
        assert!(token.expires_within(Duration::from_secs(300)));
        assert!(!token.expires_within(Duration::from_secs(10)));
    }

    #[test]
    fn expired_token_needs_refresh() {
        let token = AccessToken::new("t", SystemTime::now() - Duration::from_secs(1));
        assert!(token.expires_within(Duration::ZERO));
    }

    #[test]
    fn debug_redacts_token() {
        let token = AccessToken::new("secret", SystemTime::now());
        assert!(!format!("{:?}", token).contains("secret"));
    }
}
