//! Bearer credential issuance and verification.
//!
//! Credentials are HS256 JWTs. Access and refresh credentials are signed with
//! different secrets and carry their kind in the claims, so one can never be
//! used in place of the other.

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use skytalk_shared::UserId;

use crate::config::ServerConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("No token provided")]
    MissingCredential,

    /// The caller should refresh and retry.
    #[error("Token expired")]
    ExpiredCredential,

    /// The caller must authenticate from scratch.
    #[error("Invalid token")]
    InvalidCredential,

    #[error("User not found")]
    UnknownUser,

    #[error("User directory unavailable: {0}")]
    DirectoryUnavailable(String),
}

/// The identity bound to a connection or request for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: i64,
}

impl KeyPair {
    fn new(secret: &[u8], ttl_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl_secs,
        }
    }
}

/// Pure credential verifier. Resolving the subject against the user store is
/// a separate lookup done by the caller.
pub struct IdentityVerifier {
    access: KeyPair,
    refresh: KeyPair,
    validation: Validation,
}

impl IdentityVerifier {
    pub fn new(
        access_secret: &[u8],
        refresh_secret: &[u8],
        access_ttl_secs: i64,
        refresh_ttl_secs: i64,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            access: KeyPair::new(access_secret, access_ttl_secs),
            refresh: KeyPair::new(refresh_secret, refresh_ttl_secs),
            validation,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.jwt_secret.as_bytes(),
            config.jwt_refresh_secret.as_bytes(),
            config.access_token_ttl_secs,
            config.refresh_token_ttl_secs,
        )
    }

    fn keys(&self, kind: TokenKind) -> &KeyPair {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }

    fn issue(&self, user: UserId, kind: TokenKind) -> Result<String, AuthError> {
        let keys = self.keys(kind);
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user,
            kind,
            iat: now,
            exp: now + keys.ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .map_err(|_| AuthError::InvalidCredential)
    }

    pub fn issue_access(&self, user: UserId) -> Result<String, AuthError> {
        self.issue(user, TokenKind::Access)
    }

    pub fn issue_pair(&self, user: UserId) -> Result<TokenPair, AuthError> {
        Ok(TokenPair {
            access_token: self.issue(user, TokenKind::Access)?,
            refresh_token: self.issue(user, TokenKind::Refresh)?,
        })
    }

    fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let data = decode::<Claims>(token, &self.keys(kind).decoding, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::ExpiredCredential,
                other => {
                    debug!(error = ?other, "Credential rejected");
                    AuthError::InvalidCredential
                }
            },
        )?;

        if data.claims.kind != kind {
            return Err(AuthError::InvalidCredential);
        }
        Ok(data.claims)
    }

    /// Verify a short-lived access credential.
    pub fn verify_access(&self, token: &str) -> Result<UserId, AuthError> {
        self.verify(token, TokenKind::Access).map(|c| c.sub)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<UserId, AuthError> {
        self.verify(token, TokenKind::Refresh).map(|c| c.sub)
    }

    /// Mint a new access credential from a refresh credential.
    pub fn refresh(&self, refresh_token: &str) -> Result<(UserId, String), AuthError> {
        let user = self.verify_refresh(refresh_token)?;
        Ok((user, self.issue_access(user)?))
    }
}

/// Pull a bearer credential out of an `Authorization` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> IdentityVerifier {
        IdentityVerifier::new(b"access-secret", b"refresh-secret", 900, 3600)
    }

    #[test]
    fn test_access_round_trip() {
        let v = verifier();
        let user = UserId::new();
        let pair = v.issue_pair(user).unwrap();
        assert_eq!(v.verify_access(&pair.access_token).unwrap(), user);
        assert_eq!(v.verify_refresh(&pair.refresh_token).unwrap(), user);
    }

    #[test]
    fn test_kinds_are_not_interchangeable() {
        let v = verifier();
        let pair = v.issue_pair(UserId::new()).unwrap();
        assert_eq!(
            v.verify_access(&pair.refresh_token),
            Err(AuthError::InvalidCredential)
        );
        assert_eq!(
            v.verify_refresh(&pair.access_token),
            Err(AuthError::InvalidCredential)
        );
    }

    #[test]
    fn test_expired_access_token() {
        let v = IdentityVerifier::new(b"access-secret", b"refresh-secret", -10, 3600);
        let token = v.issue_access(UserId::new()).unwrap();
        assert_eq!(v.verify_access(&token), Err(AuthError::ExpiredCredential));
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let other = IdentityVerifier::new(b"someone-else", b"refresh-secret", 900, 3600);
        let token = other.issue_access(UserId::new()).unwrap();
        assert_eq!(
            verifier().verify_access(&token),
            Err(AuthError::InvalidCredential)
        );
        assert_eq!(
            verifier().verify_access("garbage"),
            Err(AuthError::InvalidCredential)
        );
        assert_eq!(verifier().verify_access("  "), Err(AuthError::MissingCredential));
    }

    #[test]
    fn test_refresh_mints_access() {
        let v = verifier();
        let user = UserId::new();
        let pair = v.issue_pair(user).unwrap();
        let (subject, access) = v.refresh(&pair.refresh_token).unwrap();
        assert_eq!(subject, user);
        assert_eq!(v.verify_access(&access).unwrap(), user);
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
