//! Bearer-token authentication. Caller tokens are not minted or cached by
//! the engine: every request forwards its token to the upstream `getMe`
//! endpoint and succeeds only if the upstream accepts it.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::error::AppError;
use crate::onstaq::User;
use crate::AppState;

/// Authenticated caller extractor.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|header| header.to_str().ok())
            .ok_or_else(|| {
                AppError::Unauthorized("Missing authorization header".to_string()).into_response()
            })?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            AppError::Unauthorized("Invalid authorization format".to_string()).into_response()
        })?;

        let user = state.client.validate_token(token).await.map_err(|_| {
            AppError::Unauthorized("Token rejected by upstream".to_string()).into_response()
        })?;

        Ok(AuthUser(user))
    }
}
