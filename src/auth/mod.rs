/*!
 * # Authentication
 *
 * Bearer JWTs (HS256) are validated by [`auth_middleware`], which stores the
 * resulting [`AuthUser`] in the request extensions. Handlers take `AuthUser` as an
 * extractor. Token issuance happens in the identity service, not here.
 */

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    Router,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::errors::ServiceError;

pub const ADMIN_ROLE: &str = "admin";

/// Claim structure for JWT tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Authenticated caller extracted from the bearer token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }

    /// Owners see their own resources; admins see everything.
    pub fn can_access(&self, owner_id: Uuid) -> bool {
        self.user_id == owner_id || self.is_admin()
    }

    pub fn require_admin(&self) -> Result<(), ServiceError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AuthError::InsufficientPermissions.into())
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token subject is not a user id")]
    InvalidSubject,

    #[error("Insufficient permissions")]
    InsufficientPermissions,
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InsufficientPermissions => ServiceError::Forbidden(err.to_string()),
            other => ServiceError::Unauthorized(other.to_string()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ServiceError::from(self).into_response()
    }
}

/// Validates bearer tokens against the shared HS256 secret.
#[derive(Clone)]
pub struct AuthService {
    decoding_key: DecodingKey,
}

impl AuthService {
    pub fn new(jwt_secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
        }
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
        self.authenticate_optional(headers)?
            .ok_or(AuthError::MissingAuth)
    }

    /// Like [`authenticate`](Self::authenticate), but a request without an
    /// `Authorization` header is anonymous rather than rejected.
    pub fn authenticate_optional(&self, headers: &HeaderMap) -> Result<Option<AuthUser>, AuthError> {
        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return Ok(None);
        };
        let token = value
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::InvalidToken)?;

        let claims = self.validate_token(token)?;
        let user_id = Uuid::from_str(&claims.sub).map_err(|_| AuthError::InvalidSubject)?;
        Ok(Some(AuthUser {
            user_id,
            roles: claims.roles,
        }))
    }
}

pub async fn auth_middleware(
    State(auth): State<AuthService>,
    mut request: Request,
    next: Next,
) -> Response {
    match auth.authenticate(request.headers()) {
        Ok(user) => {
            debug!(user_id = %user.user_id, "authenticated request");
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Lets anonymous requests through; a bad token is still rejected.
pub async fn optional_auth_middleware(
    State(auth): State<AuthService>,
    mut request: Request,
    next: Next,
) -> Response {
    match auth.authenticate_optional(request.headers()) {
        Ok(Some(user)) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Ok(None) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

/// Router helpers for attaching authentication layers.
pub trait AuthRouterExt<S> {
    fn with_auth(self, auth: AuthService) -> Self;
    fn with_optional_auth(self, auth: AuthService) -> Self;
}

impl<S> AuthRouterExt<S> for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn with_auth(self, auth: AuthService) -> Self {
        self.route_layer(from_fn_with_state(auth, auth_middleware))
    }

    fn with_optional_auth(self, auth: AuthService) -> Self {
        self.route_layer(from_fn_with_state(auth, optional_auth_middleware))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| AuthError::MissingAuth.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test_secret_that_is_at_least_32_characters_long";

    fn token(sub: &str, exp_offset: i64, roles: &[&str]) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: chrono::Utc::now().timestamp() + exp_offset,
            iat: None,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn valid_token_yields_user() {
        let user_id = Uuid::new_v4();
        let auth = AuthService::new(SECRET);
        let user = auth
            .authenticate(&headers(&format!("Bearer {}", token(&user_id.to_string(), 600, &["admin"]))))
            .unwrap();
        assert_eq!(user.user_id, user_id);
        assert!(user.is_admin());
        assert!(user.can_access(Uuid::new_v4()));
    }

    #[test]
    fn expired_and_foreign_tokens_are_rejected() {
        let auth = AuthService::new(SECRET);
        let sub = Uuid::new_v4().to_string();
        assert_eq!(
            auth.authenticate(&headers(&format!("Bearer {}", token(&sub, -600, &[])))),
            Err(AuthError::TokenExpired)
        );
        assert_eq!(
            AuthService::new("another_secret_that_is_also_32_chars_long!")
                .authenticate(&headers(&format!("Bearer {}", token(&sub, 600, &[])))),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(auth.authenticate(&HeaderMap::new()), Err(AuthError::MissingAuth));
        assert_eq!(auth.authenticate_optional(&HeaderMap::new()), Ok(None));
        assert_eq!(
            auth.authenticate_optional(&headers("Basic abc")),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn non_uuid_subject_is_rejected() {
        let auth = AuthService::new(SECRET);
        assert_eq!(
            auth.authenticate(&headers(&format!("Bearer {}", token("alice", 600, &[])))),
            Err(AuthError::InvalidSubject)
        );
    }

    #[test]
    fn owner_access_without_admin_role() {
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            roles: vec![],
        };
        assert!(user.can_access(user.user_id));
        assert!(!user.can_access(Uuid::new_v4()));
        assert!(matches!(user.require_admin(), Err(ServiceError::Forbidden(_))));
    }
}
