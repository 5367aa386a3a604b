//! JWT Validation
//!
//! Access tokens are issued by the main Kaiku server and signed with EdDSA
//! (Ed25519). This service only holds the public key and verifies them.

use base64::{engine::general_purpose::STANDARD, Engine};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{AuthError, AuthResult};

/// JWT claims of an access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID as UUID string).
    pub sub: String,
    /// Expiration time (Unix timestamp).
    pub exp: i64,
    /// Issued at (Unix timestamp).
    pub iat: i64,
    /// Token type (access or refresh).
    pub typ: TokenType,
}

/// Token type discriminator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Short-lived access token.
    Access,
    /// Long-lived refresh token.
    Refresh,
}

/// Verifies access tokens against one Ed25519 public key.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Build a verifier from a base64-encoded PEM public key.
    pub fn from_base64_pem(public_key: &str) -> AuthResult<Self> {
        let pem = STANDARD
            .decode(public_key)
            .map_err(|_| AuthError::Internal("Invalid base64 in JWT key".to_string()))?;
        let key = DecodingKey::from_ed_pem(&pem)
            .map_err(|e| AuthError::Internal(format!("Invalid Ed25519 public key: {e}")))?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = true;
        validation.leeway = 0;

        Ok(Self { key, validation })
    }

    /// Validate an access token and return the user it was issued to.
    ///
    /// Refresh tokens are rejected.
    pub fn verify_access(&self, token: &str) -> AuthResult<Uuid> {
        let token_data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            }
        })?;

        if token_data.claims.typ != TokenType::Access {
            return Err(AuthError::InvalidToken);
        }

        token_data
            .claims
            .sub
            .parse()
            .map_err(|_| AuthError::InvalidToken)
    }
}
