//! Bearer token verification for the two supported schemes.
//!
//! `jwt` (session) tokens carry `{user_id, exp}`; `oauth2` (delegated)
//! tokens additionally carry a `type` discriminator that must equal
//! [`OAUTH2_TOKEN_TYPE`]. Both are HS256-signed by the external issuer;
//! the gateway only verifies. Tokens are never logged in full.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::users::{Identity, UserDirectory};

/// Required `type` claim on delegated (oauth2) tokens.
pub const OAUTH2_TOKEN_TYPE: &str = "oauth2_access";

/// The two accepted credential schemes, from the `auth_type` connect param.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `auth_type=jwt`: session token with `{user_id, exp}`.
    Session,
    /// `auth_type=oauth2`: delegated token with `{type, user_id, exp}`.
    Delegated,
}

impl AuthScheme {
    /// Parse the wire value. Anything but "jwt"/"oauth2" is a hard error,
    /// not a fallthrough.
    pub fn parse(s: &str) -> Result<Self, AuthError> {
        match s {
            "jwt" => Ok(Self::Session),
            "oauth2" => Ok(Self::Delegated),
            other => Err(AuthError::UnknownScheme(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "jwt",
            Self::Delegated => "oauth2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("token has expired")]
    Expired,
    #[error("wrong token type")]
    WrongTokenType,
    #[error("invalid auth_type: {0}")]
    UnknownScheme(String),
    #[error("unknown user")]
    UnknownUser,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    user_id: String,
    exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DelegatedClaims {
    /// Discriminator; missing is treated as a mismatch, not a parse error.
    #[serde(rename = "type", default)]
    typ: String,
    user_id: String,
    exp: i64,
}

/// Verifies bearer tokens and resolves them to identities. Stateless apart
/// from the injected user directory; the directory lookup is the only async
/// step.
pub struct TokenVerifier {
    decoding: DecodingKey,
    validation: Validation,
    directory: Arc<dyn UserDirectory>,
}

impl TokenVerifier {
    pub fn new(secret: &str, directory: Arc<dyn UserDirectory>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            directory,
        }
    }

    /// Verify `token` under `scheme` and resolve the carried user id.
    pub async fn verify(&self, token: &str, scheme: AuthScheme) -> Result<Identity, AuthError> {
        let user_id = match scheme {
            AuthScheme::Session => {
                let data = decode::<SessionClaims>(token, &self.decoding, &self.validation)
                    .map_err(map_decode_error)?;
                data.claims.user_id
            }
            AuthScheme::Delegated => {
                let data = decode::<DelegatedClaims>(token, &self.decoding, &self.validation)
                    .map_err(map_decode_error)?;
                if data.claims.typ != OAUTH2_TOKEN_TYPE {
                    log::warn!("delegated token with wrong type discriminator rejected");
                    return Err(AuthError::WrongTokenType);
                }
                data.claims.user_id
            }
        };
        self.directory
            .resolve(&user_id)
            .await
            .ok_or(AuthError::UnknownUser)
    }
}

fn map_decode_error(e: jsonwebtoken::errors::Error) -> AuthError {
    match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::Malformed,
    }
}

/// Mint a session (jwt) token. Local development and test helper; the
/// production issuer lives outside the gateway.
pub fn issue_session_token(secret: &str, user_id: &str, ttl_secs: i64) -> anyhow::Result<String> {
    let claims = SessionClaims {
        user_id: user_id.to_string(),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Mint a delegated (oauth2) token with the required discriminator. Local
/// development and test helper.
pub fn issue_delegated_token(secret: &str, user_id: &str, ttl_secs: i64) -> anyhow::Result<String> {
    let claims = DelegatedClaims {
        typ: OAUTH2_TOKEN_TYPE.to_string(),
        user_id: user_id.to_string(),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::MemoryUserDirectory;

    const SECRET: &str = "test-secret";

    async fn verifier() -> TokenVerifier {
        let dir = MemoryUserDirectory::new();
        dir.insert("42", "ada").await;
        TokenVerifier::new(SECRET, Arc::new(dir))
    }

    #[tokio::test]
    async fn session_token_resolves_identity() {
        let v = verifier().await;
        let token = issue_session_token(SECRET, "42", 60).unwrap();
        let identity = v.verify(&token, AuthScheme::Session).await.unwrap();
        assert_eq!(identity.user_id, "42");
        assert_eq!(identity.username, "ada");
    }

    #[tokio::test]
    async fn expired_session_token_is_rejected() {
        let v = verifier().await;
        let token = issue_session_token(SECRET, "42", -120).unwrap();
        let err = v.verify(&token, AuthScheme::Session).await.unwrap_err();
        assert_eq!(err, AuthError::Expired);
    }

    #[tokio::test]
    async fn garbage_token_is_malformed() {
        let v = verifier().await;
        let err = v.verify("not-a-jwt", AuthScheme::Session).await.unwrap_err();
        assert_eq!(err, AuthError::Malformed);
    }

    #[tokio::test]
    async fn wrong_signing_key_is_malformed() {
        let v = verifier().await;
        let token = issue_session_token("other-secret", "42", 60).unwrap();
        let err = v.verify(&token, AuthScheme::Session).await.unwrap_err();
        assert_eq!(err, AuthError::Malformed);
    }

    #[tokio::test]
    async fn delegated_token_resolves_identity() {
        let v = verifier().await;
        let token = issue_delegated_token(SECRET, "42", 60).unwrap();
        let identity = v.verify(&token, AuthScheme::Delegated).await.unwrap();
        assert_eq!(identity.user_id, "42");
    }

    #[tokio::test]
    async fn delegated_token_without_discriminator_is_wrong_type() {
        let v = verifier().await;
        // Valid signature and expiry, but a session-shaped payload: the
        // `type` claim defaults to empty and must not match.
        let token = issue_session_token(SECRET, "42", 60).unwrap();
        let err = v.verify(&token, AuthScheme::Delegated).await.unwrap_err();
        assert_eq!(err, AuthError::WrongTokenType);
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let v = verifier().await;
        let token = issue_session_token(SECRET, "404", 60).unwrap();
        let err = v.verify(&token, AuthScheme::Session).await.unwrap_err();
        assert_eq!(err, AuthError::UnknownUser);
    }

    #[test]
    fn scheme_parse_is_closed() {
        assert_eq!(AuthScheme::parse("jwt").unwrap(), AuthScheme::Session);
        assert_eq!(AuthScheme::parse("oauth2").unwrap(), AuthScheme::Delegated);
        let err = AuthScheme::parse("bogus").unwrap_err();
        assert_eq!(err, AuthError::UnknownScheme("bogus".to_string()));
        assert!(err.to_string().contains("bogus"));
    }
}
