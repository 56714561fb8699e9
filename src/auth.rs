//! Caller identity
//!
//! Authentication happens upstream; the gateway forwards the verified user
//! name in a trusted header.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::upload::UploadError;

/// Header carrying the authenticated user name
pub const USER_HEADER: &str = "x-authenticated-user";

/// The authenticated actor making the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

impl AuthenticatedUser {
    pub fn name(&self) -> &str {
        &self.0
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = UploadError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| AuthenticatedUser(name.to_string()))
            .ok_or(UploadError::Unauthenticated)
    }
}
