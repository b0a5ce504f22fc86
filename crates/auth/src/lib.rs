use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use http::header;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use unigraph_contracts::{GatewayError, Identity, Role};

mod users;

pub use users::{AuthPayload, SystemUser, UserStore};

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub ttl: Duration,
    pub clock_skew: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    id: String,
    username: String,
    role: String,
    name: String,
    iat: u64,
    exp: u64,
}

/// Issues and verifies the HS256 bearer tokens that carry an [`Identity`].
#[derive(Clone)]
pub struct TokenService {
    ttl: Duration,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenService {
    pub fn new(config: TokenConfig) -> Result<Self, AuthError> {
        if config.secret.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "token secret must be non-empty".to_string(),
            });
        }

        if config.ttl.is_zero() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "token ttl must be positive".to_string(),
            });
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.clock_skew.as_secs();
        validation.set_required_spec_claims(&["exp", "iat"]);

        Ok(Self {
            ttl: config.ttl,
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        })
    }

    pub fn issue(&self, identity: &Identity) -> Result<String, AuthError> {
        self.issue_at(identity, unix_epoch_secs_now())
    }

    pub fn issue_at(&self, identity: &Identity, issued_at_secs: u64) -> Result<String, AuthError> {
        let claims = Claims {
            id: identity.id.clone(),
            username: identity.username.clone(),
            role: identity.role.as_str().to_string(),
            name: identity.name.clone(),
            iat: issued_at_secs,
            exp: issued_at_secs.saturating_add(self.ttl.as_secs()),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(|_| {
            AuthError {
                code: "ERR_TOKEN_ISSUE",
                message: "failed to sign token".to_string(),
            }
        })
    }

    /// Fails closed: anything short of a fully valid token yields `None`.
    pub fn verify(&self, token: &str) -> Option<Identity> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }

        let decoded = match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::debug!(reason = ?err.kind(), "auth.token_rejected");
                return None;
            }
        };

        identity_from_claims(decoded.claims)
    }

    pub fn identify(&self, headers: &HeaderMap) -> Option<Identity> {
        bearer_token(headers).and_then(|token| self.verify(token))
    }
}

fn identity_from_claims(claims: Claims) -> Option<Identity> {
    let role = Role::parse(&claims.role)?;
    let id = claims.id.trim();
    let username = claims.username.trim();
    if id.is_empty() || username.is_empty() {
        return None;
    }

    Some(Identity::new(id, username, role, claims.name))
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())?;

    authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .map(|token| token.trim())
        .filter(|token| !token.is_empty())
}

/// Single authorization predicate shared by every resolver.
pub fn authorize(identity: Option<&Identity>, required: Role) -> Result<&Identity, GatewayError> {
    let identity = identity.ok_or(GatewayError::Unauthenticated)?;
    if !identity.role.satisfies(required) {
        return Err(GatewayError::Unauthorized { required });
    }
    Ok(identity)
}

pub(crate) fn unix_epoch_secs_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(TokenConfig {
            secret: "test-secret".to_string(),
            ttl: Duration::from_secs(3600),
            clock_skew: Duration::ZERO,
        })
        .expect("token service should init")
    }

    fn admin() -> Identity {
        Identity::new("1", "admin", Role::Admin, "System Admin")
    }

    #[test]
    fn bearer_token_rejects_missing_and_malformed_headers() {
        let headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, "Bearer   ".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, "bearer tok".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("tok"));
    }

    #[test]
    fn issued_token_verifies_to_same_identity() {
        let tokens = service();
        let token = tokens.issue(&admin()).expect("issue should succeed");
        assert_eq!(tokens.verify(&token), Some(admin()));
    }

    #[test]
    fn expired_token_yields_no_identity() {
        let tokens = service();
        let token = tokens
            .issue_at(&admin(), unix_epoch_secs_now() - 7200)
            .expect("issue should succeed");
        assert_eq!(tokens.verify(&token), None);
    }

    #[test]
    fn token_signed_with_other_secret_yields_no_identity() {
        let other = TokenService::new(TokenConfig {
            secret: "other-secret".to_string(),
            ttl: Duration::from_secs(3600),
            clock_skew: Duration::ZERO,
        })
        .unwrap();
        let token = other.issue(&admin()).unwrap();

        assert_eq!(service().verify(&token), None);
        assert_eq!(service().verify("not.a.jwt"), None);
        assert_eq!(service().verify(""), None);
    }

    #[test]
    fn unknown_role_claim_yields_no_identity() {
        let tokens = service();
        let now = unix_epoch_secs_now();
        let claims = Claims {
            id: "9".to_string(),
            username: "mallory".to_string(),
            role: "root".to_string(),
            name: "M".to_string(),
            iat: now,
            exp: now + 60,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        assert_eq!(tokens.verify(&token), None);
    }

    #[test]
    fn empty_secret_is_rejected() {
        let err = TokenService::new(TokenConfig {
            secret: "  ".to_string(),
            ttl: Duration::from_secs(60),
            clock_skew: Duration::ZERO,
        })
        .err()
        .expect("empty secret must fail");
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn authorize_distinguishes_missing_and_insufficient_identity() {
        let user = Identity::new("2", "user1", Role::User, "Demo User");

        assert_eq!(
            authorize(None, Role::Guest).unwrap_err(),
            GatewayError::Unauthenticated
        );
        assert_eq!(
            authorize(Some(&user), Role::Admin).unwrap_err(),
            GatewayError::Unauthorized {
                required: Role::Admin
            }
        );
        assert_eq!(authorize(Some(&user), Role::User).unwrap(), &user);
        assert!(authorize(Some(&admin()), Role::User).is_ok());
    }
}
