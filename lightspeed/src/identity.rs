//! Resolving a request's bearer token into the acting user.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

/// The user a transfer runs as, with the token used for storage calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub access_token: String,
}

/// Validates bearer tokens. Tokens are never refreshed: an expired token is
/// simply unauthenticated.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, access_token: &str) -> Result<Identity>;
}

/// Google OAuth2 `tokeninfo` endpoint.
#[derive(Debug, Clone)]
pub struct GoogleTokenInfo {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    email: Option<String>,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl TokenInfo {
    fn expired(&self) -> bool {
        let seconds = match &self.expires_in {
            Some(serde_json::Value::Number(n)) => n.as_i64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        seconds.is_some_and(|s| s <= 0)
    }
}

impl GoogleTokenInfo {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for GoogleTokenInfo {
    async fn resolve(&self, access_token: &str) -> Result<Identity> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("access_token", access_token)])
            .send()
            .await
            .map_err(|e| Error::Other(format!("Token validation request failed: {e}")))?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "Token rejected by tokeninfo");
            return Err(Error::unauthenticated("Invalid or expired access token"));
        }

        let info: TokenInfo = response
            .json()
            .await
            .map_err(|e| Error::unauthenticated(format!("Malformed token info: {e}")))?;

        if info.expired() {
            return Err(Error::unauthenticated("Access token has expired"));
        }
        let user = info
            .email
            .filter(|e| !e.is_empty())
            .ok_or_else(|| Error::unauthenticated("Access token carries no user email"))?;

        Ok(Identity {
            user,
            access_token: access_token.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_parsing() {
        let info: TokenInfo =
            serde_json::from_str(r#"{"email":"a@b.c","expires_in":"3599"}"#).unwrap();
        assert!(!info.expired());

        let info: TokenInfo = serde_json::from_str(r#"{"email":"a@b.c","expires_in":0}"#).unwrap();
        assert!(info.expired());

        let info: TokenInfo = serde_json::from_str(r#"{"email":"a@b.c"}"#).unwrap();
        assert!(!info.expired());
    }
}
