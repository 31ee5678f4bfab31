//! Caller identity middleware.
//!
//! The identity provider in front of this service asserts the caller as
//! `X-User-Id` and `X-User-Role`. Both must be present and the role must be
//! one we know; the resulting `CallerContext` goes into request extensions.

use std::str::FromStr;

use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::CallerContext;
use crate::models::enums::Role;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const USER_ROLE_HEADER: &str = "X-User-Role";

pub async fn require_identity(mut req: Request<axum::body::Body>, next: Next) -> Response {
    match caller_from_headers(req.headers()) {
        Ok(caller) => {
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        Err(err) => err.into_response(),
    }
}

fn caller_from_headers(headers: &HeaderMap) -> Result<CallerContext, ApiError> {
    let user_id = header_text(headers, USER_ID_HEADER).ok_or(ApiError::Unauthorized)?;
    let role = header_text(headers, USER_ROLE_HEADER)
        .and_then(|raw| Role::from_str(&raw.to_lowercase()).ok())
        .ok_or(ApiError::Unauthorized)?;
    Ok(CallerContext { user_id, role })
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn both_headers_required() {
        assert!(caller_from_headers(&headers(&[])).is_err());
        assert!(caller_from_headers(&headers(&[(USER_ID_HEADER, "tech-1")])).is_err());
        assert!(caller_from_headers(&headers(&[(USER_ROLE_HEADER, "admin")])).is_err());
    }

    #[test]
    fn role_is_case_insensitive_and_known() {
        let caller = caller_from_headers(&headers(&[
            (USER_ID_HEADER, " tech-1 "),
            (USER_ROLE_HEADER, "Lab_Technician"),
        ]))
        .unwrap();
        assert_eq!(caller.user_id, "tech-1");
        assert_eq!(caller.role, Role::LabTechnician);

        assert!(caller_from_headers(&headers(&[
            (USER_ID_HEADER, "x"),
            (USER_ROLE_HEADER, "janitor"),
        ]))
        .is_err());
    }
}
