use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::errors::AppError;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Gate for operator-only endpoints.
pub fn require_admin(headers: &HeaderMap, config: &Config) -> Result<(), AppError> {
    let token = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;

    if bool::from(token.as_bytes().ct_eq(config.admin_token.as_bytes())) {
        Ok(())
    } else {
        tracing::warn!("Rejected admin request with wrong token");
        Err(AppError::Forbidden)
    }
}
