//! Request identity extracted from gateway headers
//!
//! The gateway in front of this service authenticates users and forwards the
//! result as `x-user-id`. Operators present `x-admin-token`.

use actix_web::{web, Error, FromRequest, HttpRequest};
use std::future::{ready, Ready};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Actor, ViewerIdentity};
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
pub const ANONYMOUS_ID_HEADER: &str = "x-anonymous-id";

#[derive(Debug, Clone)]
pub struct ActingUser {
    pub user_id: Option<Uuid>,
    pub admin: bool,
    anonymous_handle: Option<String>,
}

impl ActingUser {
    pub fn require_user(&self) -> Result<Uuid, AppError> {
        self.user_id
            .ok_or_else(|| AppError::NotAuthorized("missing x-user-id".to_string()))
    }

    /// Administrative override wins over the user identity
    pub fn actor(&self) -> Result<Actor, AppError> {
        if self.admin {
            return Ok(Actor::Admin);
        }
        self.require_user().map(Actor::User)
    }

    /// Identity used for the join pre-check. Visitors without a user id
    /// join anonymously under their client handle, or a fresh one.
    pub fn viewer(&self) -> ViewerIdentity {
        match (self.user_id, &self.anonymous_handle) {
            (Some(id), _) => ViewerIdentity::User(id),
            (None, Some(handle)) => ViewerIdentity::Anonymous(handle.clone()),
            (None, None) => ViewerIdentity::Anonymous(Uuid::new_v4().simple().to_string()),
        }
    }
}

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn has_admin_access(req: &HttpRequest) -> bool {
    let expected = req
        .app_data::<web::Data<AppState>>()
        .and_then(|state| state.config.security.admin_token.clone());
    match expected.as_deref() {
        Some(token) if !token.is_empty() => header(req, ADMIN_TOKEN_HEADER) == Some(token),
        _ => false,
    }
}

impl FromRequest for ActingUser {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        let user_id = match header(req, USER_ID_HEADER).map(Uuid::parse_str) {
            Some(Ok(id)) => Some(id),
            Some(Err(_)) => {
                return ready(Err(
                    AppError::Validation("x-user-id is not a valid UUID".to_string()).into(),
                ))
            }
            None => None,
        };
        let anonymous_handle = header(req, ANONYMOUS_ID_HEADER)
            .filter(|h| h.len() <= 64)
            .map(str::to_string);

        ready(Ok(ActingUser {
            user_id,
            admin: has_admin_access(req),
            anonymous_handle,
        }))
    }
}
