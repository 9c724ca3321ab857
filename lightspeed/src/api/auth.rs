//! Bearer token extraction.
//!
//! The token itself is validated by the configured
//! [`IdentityProvider`](crate::identity::IdentityProvider); this module only
//! pulls it out of the request.

use axum::http::{HeaderMap, header::AUTHORIZATION};

use crate::{Error, Result};

/// Extract the Bearer token from the Authorization header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str> {
    let auth_header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| Error::unauthenticated("Missing authorization token"))?;

    let auth_str = auth_header
        .to_str()
        .map_err(|_| Error::unauthenticated("Invalid token format"))?;

    let token = auth_str
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| Error::unauthenticated("Invalid token format"))?;

    if token.is_empty() {
        return Err(Error::unauthenticated("Missing authorization token"));
    }
    Ok(token)
}
