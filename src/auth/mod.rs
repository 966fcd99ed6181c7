//! Bearer-token identity and the order permission gate.
//!
//! Tokens are issued elsewhere; this module only verifies HS256 signatures
//! and expiry, then exposes the caller as an [`AuthUser`].

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::debug;
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// Claim structure for JWT tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,          // Subject (user ID)
    pub name: Option<String>, // User's name
    pub role: Role,
    pub iat: i64, // Issued at time
    pub exp: i64, // Expiration time
}

/// Authenticated caller extracted from the bearer token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub name: Option<String>,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn can_access(&self, owner_id: Uuid) -> bool {
        self.is_admin() || self.user_id == owner_id
    }
}

/// Verifies bearer tokens against the configured secret.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, ServiceError> {
        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| {
                debug!("Rejected bearer token: {}", e);
                match e.kind() {
                    ErrorKind::ExpiredSignature => {
                        ServiceError::Unauthorized("Token has expired".to_string())
                    }
                    _ => ServiceError::Unauthorized("Invalid authentication token".to_string()),
                }
            })?
            .claims;

        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| ServiceError::Unauthorized("Invalid authentication token".to_string()))?;

        Ok(AuthUser {
            user_id,
            name: claims.name,
            role: claims.role,
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    Arc<TokenVerifier>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = Arc::<TokenVerifier>::from_ref(state);

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ServiceError::Unauthorized("Authentication required".to_string()))?;

        verifier.verify(token)
    }
}

/// Allows the call when the user is an admin or owns the resource.
pub fn check_permission(user: &AuthUser, resource_owner: Uuid) -> Result<(), ServiceError> {
    if user.can_access(resource_owner) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(
            "Not authorized to access this route".to_string(),
        ))
    }
}

pub fn require_admin(user: &AuthUser) -> Result<(), ServiceError> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(
            "Admin role required for this route".to_string(),
        ))
    }
}
