use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::types::AccountRole;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub signing_key: String,
    pub fallback_signing_keys: Vec<String>,
    pub issuer: String,
    pub audience: String,
    pub ttl_seconds: u64,
    pub clock_skew_leeway_seconds: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub iss: String,
    pub aud: String,
    /// Account id.
    pub sub: String,
    pub role: String,
    pub exp: usize,
    #[serde(default)]
    pub iat: usize,
    #[serde(default)]
    pub jti: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub account_id: String,
    pub role: AccountRole,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

/// What a route requires of the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    User,
    Admin,
}

#[derive(Clone, Debug)]
pub struct IssuedSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingAuthorization,
    #[error("invalid authorization scheme")]
    InvalidAuthorizationScheme,
    #[error("invalid session token")]
    InvalidToken,
    #[error("session token expired")]
    TokenExpired,
    #[error("admin capability required")]
    AdminRequired,
    #[error("failed to sign session token")]
    Signing,
}

impl AuthError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingAuthorization => "missing_authorization",
            Self::InvalidAuthorizationScheme => "invalid_authorization_scheme",
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::AdminRequired => "admin_required",
            Self::Signing => "session_signing_failed",
        }
    }

    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::MissingAuthorization
                | Self::InvalidAuthorizationScheme
                | Self::InvalidToken
                | Self::TokenExpired
        )
    }
}

#[derive(Clone)]
pub struct SessionAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    fallback_decoding_keys: Vec<DecodingKey>,
    validation: Validation,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl SessionAuthority {
    #[must_use]
    pub fn from_config(config: SessionConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        validation.leeway = config.clock_skew_leeway_seconds;
        let ttl_seconds = i64::try_from(config.ttl_seconds.max(1)).unwrap_or(i64::MAX);
        Self {
            encoding_key: EncodingKey::from_secret(config.signing_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.signing_key.as_bytes()),
            fallback_decoding_keys: config
                .fallback_signing_keys
                .into_iter()
                .map(|value| DecodingKey::from_secret(value.as_bytes()))
                .collect(),
            validation,
            issuer: config.issuer,
            audience: config.audience,
            ttl: Duration::try_seconds(ttl_seconds).unwrap_or_else(|| Duration::days(7)),
        }
    }

    pub fn extract_bearer_token(header_value: Option<&str>) -> Result<&str, AuthError> {
        let raw = header_value.ok_or(AuthError::MissingAuthorization)?;
        let trimmed = raw.trim();
        let Some(token) = trimmed.strip_prefix("Bearer ") else {
            return Err(AuthError::InvalidAuthorizationScheme);
        };
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::InvalidAuthorizationScheme);
        }
        Ok(token)
    }

    pub fn issue(
        &self,
        account_id: &str,
        role: AccountRole,
        now: DateTime<Utc>,
    ) -> Result<IssuedSession, AuthError> {
        let expires_at = now + self.ttl;
        let claims = SessionClaims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: account_id.to_string(),
            role: role.as_str().to_string(),
            exp: expires_at.timestamp().max(0) as usize,
            iat: now.timestamp().max(0) as usize,
            jti: Uuid::now_v7().simple().to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| AuthError::Signing)?;
        Ok(IssuedSession { token, expires_at })
    }

    pub fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = self.decode_claims(token)?;
        let account_id = claims.sub.trim();
        if account_id.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        let role = AccountRole::parse(&claims.role).ok_or(AuthError::InvalidToken)?;
        Ok(Principal {
            account_id: account_id.to_string(),
            role,
        })
    }

    /// The single per-request authorization check.
    pub fn authorize(
        &self,
        header_value: Option<&str>,
        capability: Capability,
    ) -> Result<Principal, AuthError> {
        let token = Self::extract_bearer_token(header_value)?;
        let principal = self.authenticate(token)?;
        if capability == Capability::Admin && !principal.is_admin() {
            return Err(AuthError::AdminRequired);
        }
        Ok(principal)
    }

    fn decode_claims(&self, token: &str) -> Result<SessionClaims, AuthError> {
        match decode::<SessionClaims>(token, &self.decoding_key, &self.validation) {
            Ok(decoded) => Ok(decoded.claims),
            Err(primary_error) => {
                if is_signature_error(&primary_error) {
                    for key in &self.fallback_decoding_keys {
                        if let Ok(decoded) = decode::<SessionClaims>(token, key, &self.validation)
                        {
                            return Ok(decoded.claims);
                        }
                    }
                }
                Err(map_decode_error(primary_error))
            }
        }
    }
}

fn is_signature_error(error: &jsonwebtoken::errors::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm
    )
}

fn map_decode_error(error: jsonwebtoken::errors::Error) -> AuthError {
    match error.kind() {
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken,
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("failed to hash credential: {0}")]
pub struct CredentialError(String);

pub trait CredentialHasher: Send + Sync {
    fn hash(&self, password: &str) -> Result<String, CredentialError>;
    fn verify(&self, password: &str, stored_hash: &str) -> bool;
}

/// Adaptive bcrypt hashing; the cost factor is embedded in every stored hash.
#[derive(Debug, Clone, Copy)]
pub struct BcryptCredentialHasher {
    cost: u32,
}

impl BcryptCredentialHasher {
    pub const MIN_COST: u32 = 4;
    pub const MAX_COST: u32 = 31;

    #[must_use]
    pub fn new(cost: u32) -> Self {
        Self {
            cost: cost.clamp(Self::MIN_COST, Self::MAX_COST),
        }
    }

    #[must_use]
    pub fn cost(&self) -> u32 {
        self.cost
    }
}

impl Default for BcryptCredentialHasher {
    fn default() -> Self {
        Self::new(10)
    }
}

impl CredentialHasher for BcryptCredentialHasher {
    fn hash(&self, password: &str) -> Result<String, CredentialError> {
        bcrypt::hash(password, self.cost).map_err(|error| CredentialError(error.to_string()))
    }

    // Hashes that do not parse as bcrypt never verify.
    fn verify(&self, password: &str, stored_hash: &str) -> bool {
        bcrypt::verify(password, stored_hash).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header, encode};

    use super::{
        AuthError, BcryptCredentialHasher, Capability, CredentialHasher, SessionAuthority,
        SessionClaims, SessionConfig,
    };
    use crate::ledger::types::AccountRole;

    fn authority(key: &str) -> SessionAuthority {
        SessionAuthority::from_config(SessionConfig {
            signing_key: key.to_string(),
            fallback_signing_keys: vec!["previous-key".to_string()],
            issuer: "https://grabdesk.test".to_string(),
            audience: "grabdesk-ledger".to_string(),
            ttl_seconds: 3600,
            clock_skew_leeway_seconds: 0,
        })
    }

    #[test]
    fn bearer_extraction_requires_scheme() {
        assert_eq!(
            SessionAuthority::extract_bearer_token(None),
            Err(AuthError::MissingAuthorization)
        );
        assert_eq!(
            SessionAuthority::extract_bearer_token(Some("token")),
            Err(AuthError::InvalidAuthorizationScheme)
        );
        assert_eq!(
            SessionAuthority::extract_bearer_token(Some("Bearer  abc ")),
            Ok("abc")
        );
    }

    #[test]
    fn issued_session_round_trips_principal() {
        let authority = authority("session-test-key");
        let issued = authority
            .issue("acct_1", AccountRole::Admin, Utc::now())
            .expect("session should issue");
        let principal = authority
            .authenticate(&issued.token)
            .expect("session should authenticate");
        assert_eq!(principal.account_id, "acct_1");
        assert!(principal.is_admin());
    }

    #[test]
    fn user_token_cannot_pass_admin_check() {
        let authority = authority("session-test-key");
        let issued = authority
            .issue("acct_2", AccountRole::User, Utc::now())
            .expect("session should issue");
        let header = format!("Bearer {}", issued.token);
        assert!(authority.authorize(Some(&header), Capability::User).is_ok());
        assert_eq!(
            authority.authorize(Some(&header), Capability::Admin),
            Err(AuthError::AdminRequired)
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let key = "session-test-key";
        let authority = authority(key);
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            iss: "https://grabdesk.test".to_string(),
            aud: "grabdesk-ledger".to_string(),
            sub: "acct_3".to_string(),
            role: "user".to_string(),
            exp: (now - 600) as usize,
            iat: (now - 1200) as usize,
            jti: "expired".to_string(),
        };
        let token = encode(
            &Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(key.as_bytes()),
        )
        .expect("token should encode");
        assert_eq!(authority.authenticate(&token), Err(AuthError::TokenExpired));
    }

    #[test]
    fn fallback_key_still_verifies_rotated_sessions() {
        let old = authority("previous-key");
        let issued = old
            .issue("acct_4", AccountRole::User, Utc::now())
            .expect("session should issue");
        let current = authority("session-test-key");
        assert!(current.authenticate(&issued.token).is_ok());
        assert_eq!(
            current.authenticate("this-is-not-a-jwt"),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn credential_hash_is_salted_and_verifiable() {
        let hasher = BcryptCredentialHasher::new(BcryptCredentialHasher::MIN_COST);
        let first = hasher.hash("hunter22").expect("hash should succeed");
        let second = hasher.hash("hunter22").expect("hash should succeed");
        assert_ne!(first, second);
        assert!(first.starts_with("$2b$04$"));
        assert!(!first.contains("hunter22"));
        assert!(hasher.verify("hunter22", &first));
        assert!(hasher.verify("hunter22", &second));
        assert!(!hasher.verify("hunter23", &first));
        assert!(!hasher.verify("hunter22", "plain-text"));
        assert!(!hasher.verify("hunter22", ""));
    }

    #[test]
    fn credential_cost_is_clamped_and_embedded() {
        assert_eq!(BcryptCredentialHasher::new(0).cost(), 4);
        assert_eq!(BcryptCredentialHasher::new(99).cost(), 31);
        assert_eq!(BcryptCredentialHasher::default().cost(), 10);

        let hasher = BcryptCredentialHasher::new(5);
        let stored = hasher.hash("hunter22").expect("hash should succeed");
        assert!(stored.starts_with("$2b$05$"));
        let verifier = BcryptCredentialHasher::new(BcryptCredentialHasher::MIN_COST);
        assert!(verifier.verify("hunter22", &stored));
    }
}
