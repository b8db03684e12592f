//! # Token Authentication
//!
//! Presenters, operators and internal services all authenticate with an HS256
//! JWT carrying identity, role, issuer, audience and expiry. Tokens are issued
//! elsewhere; this module only verifies them (and signs them for tests and
//! operator tooling).
//!
//! ## Where tokens come from:
//! - `Authorization: Bearer <token>` on ordinary HTTP requests
//! - `?token=<token>` on WebSocket upgrades (browsers cannot set headers there)

use crate::config::AuthConfig;
use crate::error::AppError;
use crate::state::AppState;
use actix_web::{dev::Payload, http::header, web, FromRequest, HttpRequest};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::{ready, Ready};
use std::sync::Arc;

/// What an authenticated caller is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May hold the on-air slot.
    Presenter,
    /// Privileged operator: may broadcast and force-stop anyone.
    Admin,
    /// Internal service-to-service caller (upload handler).
    Service,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Presenter => "presenter",
            Role::Admin => "admin",
            Role::Service => "service",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JWT claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// A verified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub role: Role,
    pub display_name: Option<String>,
    /// When the token backing this identity was issued.
    pub issued_at: DateTime<Utc>,
}

impl Identity {
    pub fn is(&self, role: Role) -> bool {
        self.role == role
    }

    pub fn require_any(&self, roles: &[Role]) -> Result<(), AppError> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "role '{}' may not perform this action",
                self.role
            )))
        }
    }
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.sub,
            role: claims.role,
            display_name: claims.name,
            issued_at: Utc.timestamp_opt(claims.iat, 0).single().unwrap_or_else(Utc::now),
        }
    }
}

/// Signs and verifies tokens with the shared secret.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    issuer: String,
    audience: String,
    leeway_secs: u64,
}

impl fmt::Debug for JwtService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtService")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish()
    }
}

impl JwtService {
    pub fn new(config: &AuthConfig) -> Self {
        let secret = config.jwt_secret.as_bytes();
        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            leeway_secs: config.leeway_secs,
        }
    }

    /// Sign a token for `subject` valid for `ttl`.
    pub fn issue(
        &self,
        subject: &str,
        role: Role,
        name: Option<&str>,
        ttl: Duration,
    ) -> anyhow::Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            role,
            name: name.map(str::to_string),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    /// Verify signature, issuer, audience and expiry.
    pub fn verify(&self, token: &str) -> Result<Identity, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = self.leeway_secs;

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            let reason = match e.kind() {
                ErrorKind::ExpiredSignature => "token expired",
                ErrorKind::InvalidIssuer => "invalid token issuer",
                ErrorKind::InvalidAudience => "invalid token audience",
                ErrorKind::InvalidSignature => "invalid token signature",
                _ => "invalid token",
            };
            AppError::Unauthorized(reason.to_string())
        })?;

        Ok(data.claims.into())
    }
}

/// Pull the raw token out of a request: bearer header first, then `?token=`.
pub fn extract_token(req: &HttpRequest) -> Option<String> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        if let Some(token) = value.to_str().ok().and_then(|v| v.strip_prefix("Bearer ")) {
            return Some(token.trim().to_string());
        }
    }

    web::Query::<std::collections::HashMap<String, String>>::from_query(req.query_string())
        .ok()
        .and_then(|q| q.get("token").cloned())
        .filter(|t| !t.is_empty())
}

/// Verify the token on `req` against the service's `JwtService`.
pub fn authenticate(req: &HttpRequest) -> Result<Identity, AppError> {
    let state = req
        .app_data::<web::Data<AppState>>()
        .ok_or_else(|| AppError::Internal("application state not configured".to_string()))?;
    let token = extract_token(req)
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?;
    state.jwt.verify(&token)
}

impl FromRequest for Identity {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(authenticate(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    fn service() -> JwtService {
        JwtService::new(&AuthConfig {
            jwt_secret: "test-secret".to_string(),
            issuer: "onair".to_string(),
            audience: "onair-clients".to_string(),
            leeway_secs: 0,
        })
    }

    #[test]
    fn test_issue_then_verify() {
        let jwt = service();
        let token = jwt
            .issue("presenter-a", Role::Presenter, Some("Ustadh A"), Duration::hours(1))
            .unwrap();

        let identity = jwt.verify(&token).unwrap();
        assert_eq!(identity.id, "presenter-a");
        assert_eq!(identity.role, Role::Presenter);
        assert_eq!(identity.display_name.as_deref(), Some("Ustadh A"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = service();
        let token = jwt
            .issue("presenter-a", Role::Presenter, None, Duration::hours(-2))
            .unwrap();

        match jwt.verify(&token) {
            Err(AppError::Unauthorized(msg)) => assert_eq!(msg, "token expired"),
            other => panic!("expected unauthorized, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let jwt = service();
        let other = JwtService::new(&AuthConfig {
            jwt_secret: "test-secret".to_string(),
            issuer: "onair".to_string(),
            audience: "someone-else".to_string(),
            leeway_secs: 0,
        });
        let token = other
            .issue("presenter-a", Role::Presenter, None, Duration::hours(1))
            .unwrap();

        assert!(matches!(jwt.verify(&token), Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let jwt = service();
        let forged = JwtService::new(&AuthConfig {
            jwt_secret: "another-secret".to_string(),
            issuer: "onair".to_string(),
            audience: "onair-clients".to_string(),
            leeway_secs: 0,
        });
        let token = forged
            .issue("admin", Role::Admin, None, Duration::hours(1))
            .unwrap();

        assert!(jwt.verify(&token).is_err());
    }

    #[test]
    fn test_extract_token_from_header_and_query() {
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Bearer abc.def"))
            .to_http_request();
        assert_eq!(extract_token(&req).as_deref(), Some("abc.def"));

        let req = TestRequest::with_uri("/ws/presenter?token=xyz").to_http_request();
        assert_eq!(extract_token(&req).as_deref(), Some("xyz"));

        let req = TestRequest::default().to_http_request();
        assert!(extract_token(&req).is_none());
    }

    #[test]
    fn test_role_gate() {
        let identity = Identity {
            id: "svc".to_string(),
            role: Role::Service,
            display_name: None,
            issued_at: Utc::now(),
        };
        assert!(identity.require_any(&[Role::Service, Role::Admin]).is_ok());
        assert!(matches!(
            identity.require_any(&[Role::Admin]),
            Err(AppError::Forbidden(_))
        ));
    }
}
