use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use mesh_protocol::Identity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token missing subject")]
    MissingSubject,
}

/// Claims carried by identity tokens issued by the external auth service.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exp: usize,
}

/// Turns a bearer token into a verified [`Identity`].
#[derive(Clone)]
pub enum TokenVerifier {
    /// HS256 tokens signed with a shared secret.
    Jwt {
        key: DecodingKey,
        validation: Validation,
    },
    /// Development mode: the token itself is `user_id[:display name]`.
    Insecure,
}

impl TokenVerifier {
    pub fn hs256(secret: &[u8], issuer: Option<&str>, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        match audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        TokenVerifier::Jwt {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn is_insecure(&self) -> bool {
        matches!(self, TokenVerifier::Insecure)
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        match self {
            TokenVerifier::Jwt { key, validation } => {
                let data = decode::<IdentityClaims>(token, key, validation)?;
                identity(data.claims.sub, data.claims.name)
            }
            TokenVerifier::Insecure => {
                let (user, name) = match token.split_once(':') {
                    Some((user, name)) => (user, Some(name.to_string())),
                    None => (token, None),
                };
                identity(user.to_string(), name)
            }
        }
    }
}

fn identity(user_id: String, name: Option<String>) -> Result<Identity, AuthError> {
    let user_id = user_id.trim().to_string();
    if user_id.is_empty() {
        return Err(AuthError::MissingSubject);
    }
    let display_name = name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| user_id.clone());
    Ok(Identity {
        user_id,
        display_name,
    })
}

/// Extracts the token from an `Authorization: Bearer` header.
pub fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}
