//! Caller identity, as asserted by the authenticating proxy in front of us.
//!
//! Headers:
//! - `x-user-id` (required)
//! - `x-user-name`, `x-user-account`, `x-organization-id` (optional)

use crate::{errors::AppError, models::upload::Uploader};
use axum::{extract::FromRequestParts, http::request::Parts};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";
pub const USER_ACCOUNT_HEADER: &str = "x-user-account";
pub const ORGANIZATION_HEADER: &str = "x-organization-id";

impl<S> FromRequestParts<S> for Uploader
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let id = header(USER_ID_HEADER)
            .ok_or_else(|| AppError::unauthorized("missing caller identity"))?;

        Ok(Uploader {
            id,
            name: header(USER_NAME_HEADER),
            account: header(USER_ACCOUNT_HEADER),
            organization_id: header(ORGANIZATION_HEADER),
        })
    }
}
