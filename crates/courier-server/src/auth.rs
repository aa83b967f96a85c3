//! Access-token verification.
//!
//! Tokens are HS256 JWTs issued by the account service; `sub` carries the
//! user id. The server only verifies them.

use axum::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
#[cfg(test)]
use chrono::Utc;
#[cfg(test)]
use jsonwebtoken::{encode, EncodingKey, Header};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use courier_shared::types::UserId;

use crate::error::ServerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

#[derive(Clone)]
pub struct JwtVerifier {
    decoding: DecodingKey,
    #[cfg(test)]
    encoding: EncodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            #[cfg(test)]
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<UserId, ServerError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            debug!("Token rejected: {e}");
            ServerError::Unauthorized("invalid or expired token".to_string())
        })?;
        let user = UserId::new(data.claims.sub.trim());
        if user.is_empty() {
            return Err(ServerError::Unauthorized("token has no subject".to_string()));
        }
        Ok(user)
    }

    #[cfg(test)]
    pub fn issue(&self, user: &UserId, ttl: chrono::Duration) -> Result<String, ServerError> {
        let claims = Claims {
            sub: user.to_string(),
            exp: (Utc::now() + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ServerError::Upstream(format!("token signing failed: {e}")))
    }
}

/// The token of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// The authenticated caller of an HTTP handler.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    JwtVerifier: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ServerError::Unauthorized("missing bearer token".to_string()))?;
        let verifier = JwtVerifier::from_ref(state);
        Ok(AuthUser(verifier.verify(token)?))
    }
}
