//! Caller identity taken from gateway headers.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use common::UserId;
use transfer::{Claimer, Requester};

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const ADMIN_HEADER: &str = "x-admin";

/// Identity of the caller as asserted by the upstream gateway.
///
/// The gateway authenticates; this service only reads what it forwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Option<UserId>,
    pub email: Option<String>,
    pub admin: bool,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl Caller {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            user_id: header_str(headers, USER_ID_HEADER).map(UserId::from),
            email: header_str(headers, USER_EMAIL_HEADER).map(str::to_string),
            admin: header_str(headers, ADMIN_HEADER).is_some_and(|v| v.eq_ignore_ascii_case("true")),
        }
    }

    pub fn require_user(&self) -> Result<&UserId, ApiError> {
        self.user_id
            .as_ref()
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {USER_ID_HEADER} header")))
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.admin {
            Ok(())
        } else {
            Err(ApiError::Forbidden("admin access required".to_string()))
        }
    }

    pub fn claimer(&self) -> Result<Claimer, ApiError> {
        Ok(Claimer {
            user_id: self.require_user()?.clone(),
            email: self.email.clone(),
        })
    }

    /// Admins act as [`Requester::Admin`] even when they also send a user id.
    pub fn requester(&self) -> Result<Requester, ApiError> {
        if self.admin {
            return Ok(Requester::Admin);
        }
        Ok(Requester::User(self.require_user()?.clone()))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller::from_headers(&parts.headers))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn reads_identity_headers() {
        let caller = Caller::from_headers(&headers(&[
            ("x-user-id", " b "),
            ("x-user-email", "B@x.com"),
        ]));
        assert_eq!(caller.user_id, Some(UserId::from("b")));
        assert_eq!(caller.email.as_deref(), Some("B@x.com"));
        assert!(!caller.admin);
    }

    #[test]
    fn missing_user_is_unauthorized() {
        let caller = Caller::from_headers(&HeaderMap::new());
        assert!(matches!(caller.require_user(), Err(ApiError::Unauthorized(_))));
        assert!(matches!(caller.requester(), Err(ApiError::Unauthorized(_))));
    }

    #[test]
    fn admin_flag_overrides_user() {
        let caller = Caller::from_headers(&headers(&[("x-user-id", "a"), ("x-admin", "TRUE")]));
        assert_eq!(caller.requester().unwrap(), Requester::Admin);
        assert!(caller.require_admin().is_ok());

        let caller = Caller::from_headers(&headers(&[("x-admin", "yes")]));
        assert!(caller.require_admin().is_err());
    }
}
