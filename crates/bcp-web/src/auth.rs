//! Request identity and the ingest shared secret.
//!
//! Browser-facing routes take a [`CurrentUser`]: the subject of an HS256 bearer
//! token, or (only when no JWT secret is configured and the deployment opts in)
//! the `x-user-id` header set by a trusted proxy. Engine-facing routes take an
//! [`IngestSecret`], which compares SHA-256 digests of the presented and configured
//! secrets.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap};
use bcp_jobs::JobError;
use bcp_storage::SECRET_HEADER;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{ApiError, AppState};

pub const USER_HEADER: &str = "x-user-id";
const USER_ID_MAX: usize = 128;

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub ingest_secret: String,
    pub jwt_secret: Option<String>,
    pub trust_user_header: bool,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Digest of the configured ingest secret; `None` when unset, which rejects everything.
pub(crate) fn secret_digest(secret: &str) -> Option<[u8; 32]> {
    (!secret.is_empty()).then(|| Sha256::digest(secret.as_bytes()).into())
}

pub(crate) fn secret_matches(expected: Option<&[u8; 32]>, presented: Option<&str>) -> bool {
    let (Some(expected), Some(presented)) = (expected, presented) else {
        return false;
    };
    let presented: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
    presented
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Resolves the calling user id, or [`JobError::Unauthenticated`].
pub fn resolve_current_user_id(config: &AuthConfig, headers: &HeaderMap) -> Result<String, JobError> {
    if let Some(secret) = config.jwt_secret.as_deref() {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or(JobError::Unauthenticated)?;
        let key = DecodingKey::from_secret(secret.as_bytes());
        let data = decode::<Claims>(token, &key, &Validation::new(Algorithm::HS256)).map_err(|err| {
            tracing::debug!(error = %err, "bearer token rejected");
            JobError::Unauthenticated
        })?;
        return non_empty_user(&data.claims.sub);
    }

    if config.trust_user_header {
        let user = headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(JobError::Unauthenticated)?;
        return non_empty_user(user);
    }

    Err(JobError::Unauthenticated)
}

fn non_empty_user(raw: &str) -> Result<String, JobError> {
    let user = raw.trim();
    if user.is_empty() || user.chars().count() > USER_ID_MAX {
        return Err(JobError::Unauthenticated);
    }
    Ok(user.to_string())
}

/// Extractor for routes that need a signed-in user.
pub struct CurrentUser(pub String);

impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        resolve_current_user_id(&state.auth, &parts.headers)
            .map(CurrentUser)
            .map_err(ApiError)
    }
}

/// Extractor for routes called by the automation engine.
pub struct IngestSecret;

impl FromRequestParts<Arc<AppState>> for IngestSecret {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let presented = parts.headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if secret_matches(state.ingest_digest.as_ref(), presented) {
            return Ok(IngestSecret);
        }
        tracing::warn!(
            path = %parts.uri.path(),
            header_present = presented.is_some(),
            "ingest secret rejected"
        );
        Err(ApiError(JobError::Forbidden))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        exp: u64,
    }

    fn token(secret: &str, sub: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &TestClaims { sub, exp: 4_102_444_800 },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn secret_comparison() {
        let digest = secret_digest("hunter2");
        assert!(secret_matches(digest.as_ref(), Some("hunter2")));
        assert!(!secret_matches(digest.as_ref(), Some("hunter3")));
        assert!(!secret_matches(digest.as_ref(), None));
        assert!(secret_digest("").is_none());
        assert!(!secret_matches(None, Some("")));
    }

    #[test]
    fn bearer_token_subject_is_the_user() {
        let config = AuthConfig {
            jwt_secret: Some("jwt-secret".into()),
            ..AuthConfig::default()
        };
        let ok = headers(&[("authorization", format!("Bearer {}", token("jwt-secret", "user_42")))]);
        assert_eq!(resolve_current_user_id(&config, &ok).unwrap(), "user_42");

        let forged = headers(&[("authorization", format!("Bearer {}", token("other", "user_42")))]);
        assert!(matches!(
            resolve_current_user_id(&config, &forged),
            Err(JobError::Unauthenticated)
        ));
    }

    #[test]
    fn user_header_needs_opt_in_and_no_jwt_secret() {
        let with_header = headers(&[("x-user-id", "user_a".to_string())]);
        assert!(resolve_current_user_id(&AuthConfig::default(), &with_header).is_err());

        let trusted = AuthConfig {
            trust_user_header: true,
            ..AuthConfig::default()
        };
        assert_eq!(resolve_current_user_id(&trusted, &with_header).unwrap(), "user_a");

        let jwt_wins = AuthConfig {
            trust_user_header: true,
            jwt_secret: Some("jwt-secret".into()),
            ..AuthConfig::default()
        };
        assert!(resolve_current_user_id(&jwt_wins, &with_header).is_err());
    }
}
