//! Caller identity.
//!
//! Authentication is handled in front of the service; handlers only need to
//! know who is asking so operations and history can be attributed.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::api::status::AppError;
use crate::api::{ANONYMOUS, USER_HEADER};

/// The user id taken from the `x-user-id` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

impl Caller {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(USER_HEADER) else {
            return Ok(Caller(ANONYMOUS.to_string()));
        };
        let user = value
            .to_str()
            .map_err(|_| AppError::BadRequest(format!("{USER_HEADER} is not valid text")))?
            .trim();
        if user.is_empty() {
            return Ok(Caller(ANONYMOUS.to_string()));
        }
        if user.len() > 128 || user.chars().any(char::is_control) {
            return Err(AppError::BadRequest(format!("invalid {USER_HEADER} header")));
        }
        Ok(Caller(user.to_string()))
    }
}
