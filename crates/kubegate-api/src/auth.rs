//! Request authentication
//!
//! Tokens are HS256 JWTs issued by the login service that shares the
//! gateway's secret. A request may carry one in the `Authorization: Bearer`
//! header, the `token` cookie, or (upgrade requests only, since browsers
//! cannot set headers on a WebSocket handshake) the `token` query parameter.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ApiError, Error, Result};
use crate::server::AppState;

/// Claims carried by gateway tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Numeric user id
    pub user_id: i64,
    /// Login name
    pub username: String,
    /// Role name
    pub role: String,
    /// Expiry, seconds since the epoch
    pub exp: u64,
}

/// Authenticated caller, available to handlers as a request extension
#[derive(Debug, Clone, Serialize)]
pub struct UserIdentity {
    /// Numeric user id
    pub user_id: i64,
    /// Login name
    pub username: String,
    /// Role name
    pub role: String,
}

/// Validates gateway tokens
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Validator for tokens signed with `secret`
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims = ["exp".to_string()].into_iter().collect();
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }

    /// Check signature and expiry and extract the identity
    pub fn validate(&self, token: &str) -> Result<UserIdentity> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| Error::authentication(format!("invalid token: {}", e)))?;
        Ok(UserIdentity {
            user_id: data.claims.user_id,
            username: data.claims.username,
            role: data.claims.role,
        })
    }
}

/// Extract a bearer token from the Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Extract the `token` cookie
pub fn extract_cookie_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "token")
        .map(|(_, value)| value)
        .filter(|t| !t.is_empty())
}

/// Extract the `token` query parameter
pub fn extract_query_token(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == "token")
        .map(|(_, value)| value)
        .filter(|t| !t.is_empty())
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Pick the request's token from the sources it may legitimately use
pub fn request_token<'a>(headers: &'a HeaderMap, query: Option<&'a str>) -> Option<&'a str> {
    extract_bearer_token(headers)
        .or_else(|| extract_cookie_token(headers))
        .or_else(|| {
            if is_upgrade(headers) {
                extract_query_token(query)
            } else {
                None
            }
        })
}

/// Middleware rejecting unauthenticated requests before any cluster access
pub async fn require_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let identity = {
        let token = request_token(request.headers(), request.uri().query());
        match token {
            Some(token) => state.auth.validate(token),
            None => Err(Error::authentication("missing token")),
        }
    };

    match identity {
        Ok(identity) => {
            debug!(user = %identity.username, role = %identity.role, "authenticated request");
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}
