//! Caller identification
//!
//! Identity is supplied by the fronting session provider in the
//! `X-Versus-User` header.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};

use crate::error::AppError;

pub const USER_HEADER: &str = "X-Versus-User";

const MAX_USER_ID_LEN: usize = 128;

fn extract_user_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_USER_ID_LEN)
        .map(ToOwned::to_owned)
}

/// Extractor for the current user id
///
/// # Usage
/// ```ignore
/// async fn handler(
///     CurrentUser(user_id): CurrentUser,
/// ) -> impl IntoResponse {
///     format!("Hello, {}", user_id)
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<CurrentUser>().cloned() {
            return Ok(user);
        }

        let user = CurrentUser(extract_user_from_headers(&parts.headers).ok_or(AppError::Unauthorized)?);
        parts.extensions.insert(user.clone());

        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn header_is_trimmed_and_bounded() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_user_from_headers(&headers), None);

        headers.insert(USER_HEADER, HeaderValue::from_static("  alice "));
        assert_eq!(extract_user_from_headers(&headers).as_deref(), Some("alice"));

        headers.insert(USER_HEADER, HeaderValue::from_static("   "));
        assert_eq!(extract_user_from_headers(&headers), None);

        let long = "u".repeat(MAX_USER_ID_LEN + 1);
        headers.insert(USER_HEADER, HeaderValue::from_str(&long).unwrap());
        assert_eq!(extract_user_from_headers(&headers), None);
    }
}
