//! Identity verification for joining replicas.
//!
//! The server only needs `verify(token) -> Identity`; where tokens come from
//! is up to the deployment. Three verifiers are provided:
//!
//! - [`HmacTokens`]: `base64url(user) "." base64url(HMAC-SHA256(secret, user))`
//! - [`StaticTokens`]: fixed token table, for tests and development
//! - [`OpenAccess`]: accepts any non-empty token as the user name

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// A verified user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
}

impl Identity {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("malformed token")]
    Malformed,
    #[error("invalid token")]
    Invalid,
    #[error("unusable signing secret")]
    InvalidSecret,
}

/// Verifies the token a replica presents on join.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// HMAC-signed tokens.
#[derive(Clone)]
pub struct HmacTokens {
    keyed: HmacSha256,
}

impl HmacTokens {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, AuthError> {
        let keyed = <HmacSha256 as Mac>::new_from_slice(secret.as_ref())
            .map_err(|_| AuthError::InvalidSecret)?;
        Ok(Self { keyed })
    }

    /// Issue a token for `user`.
    pub fn issue(&self, user: &str) -> String {
        let tag = self.mac(user.as_bytes()).finalize().into_bytes();
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(user.as_bytes()),
            URL_SAFE_NO_PAD.encode(tag)
        )
    }

    fn mac(&self, user: &[u8]) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(user);
        mac
    }
}

impl IdentityVerifier for HmacTokens {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let (user_b64, tag_b64) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let user = URL_SAFE_NO_PAD
            .decode(user_b64)
            .map_err(|_| AuthError::Malformed)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| AuthError::Malformed)?;

        // Constant-time comparison.
        self.mac(&user)
            .verify_slice(&tag)
            .map_err(|_| AuthError::Invalid)?;

        let user = String::from_utf8(user).map_err(|_| AuthError::Malformed)?;
        Ok(Identity { user })
    }
}

/// Fixed token → identity table.
#[derive(Debug, Default, Clone)]
pub struct StaticTokens {
    tokens: HashMap<String, Identity>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, token: impl Into<String>, user: impl Into<String>) -> Self {
        self.insert(token, user);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, user: impl Into<String>) {
        self.tokens.insert(token.into(), Identity::new(user));
    }
}

impl IdentityVerifier for StaticTokens {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.tokens.get(token).cloned().ok_or(AuthError::Invalid)
    }
}

/// Accepts every non-empty token and uses it as the user name.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAccess;

impl IdentityVerifier for OpenAccess {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        Ok(Identity::new(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_issue_and_verify() {
        let tokens = HmacTokens::new("s3cret").unwrap();
        let token = tokens.issue("alice");
        assert_eq!(tokens.verify(&token).unwrap(), Identity::new("alice"));
    }

    #[test]
    fn test_hmac_rejects_other_secret() {
        let token = HmacTokens::new("one").unwrap().issue("alice");
        assert_eq!(HmacTokens::new("two").unwrap().verify(&token), Err(AuthError::Invalid));
    }

    #[test]
    fn test_hmac_rejects_swapped_user() {
        let tokens = HmacTokens::new("s3cret").unwrap();
        let alice = tokens.issue("alice");
        let (_, tag) = alice.split_once('.').unwrap();
        let forged = format!("{}.{tag}", URL_SAFE_NO_PAD.encode("mallory"));
        assert_eq!(tokens.verify(&forged), Err(AuthError::Invalid));
    }

    #[test]
    fn test_hmac_malformed() {
        let tokens = HmacTokens::new("s3cret").unwrap();
        assert_eq!(tokens.verify(""), Err(AuthError::MissingToken));
        assert_eq!(tokens.verify("no-dot"), Err(AuthError::Malformed));
        assert_eq!(tokens.verify("!!.??"), Err(AuthError::Malformed));
    }

    #[test]
    fn test_static_tokens() {
        let tokens = StaticTokens::new().with("t-alice", "alice");
        assert_eq!(tokens.verify("t-alice").unwrap().user, "alice");
        assert_eq!(tokens.verify("t-bob"), Err(AuthError::Invalid));
        assert_eq!(tokens.verify(""), Err(AuthError::MissingToken));
    }

    #[test]
    fn test_open_access() {
        assert_eq!(OpenAccess.verify("bob").unwrap().user, "bob");
        assert!(OpenAccess.verify("").is_err());
    }
}
