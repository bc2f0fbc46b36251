//! Caller identity.
//!
//! Session issuance lives elsewhere; this module only verifies bearer tokens
//! minted by that collaborator and exposes the resulting [`CallerIdentity`].

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{StatusCode, header, request::Parts},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use crate::{
    errors::{AppError, GatewayError},
    services::hooks::RequestSnapshot,
};

const ADMIN_ROLE: &str = "admin";

/// The authenticated principal behind a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: String,
    pub app_id: Option<String>,
    pub roles: Vec<String>,
}

impl CallerIdentity {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role == ADMIN_ROLE)
    }
}

/// Token verification settings.
#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub issuer: Option<String>,
    pub leeway: Duration,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("leeway", &self.leeway)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    app_id: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
}

pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
    #[cfg(test)]
    config: AuthConfig,
}

impl JwtVerifier {
    pub fn new(config: AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation.leeway = config.leeway.as_secs();

        Self {
            key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            #[cfg(test)]
            config,
        }
    }

    pub fn verify(&self, token: &str) -> Result<CallerIdentity, AppError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|err| {
            tracing::debug!(error = %err, "rejected bearer token");
            AppError::new(StatusCode::UNAUTHORIZED, "invalid bearer token")
        })?;
        let claims = data.claims;
        Ok(CallerIdentity {
            user_id: claims.sub,
            app_id: claims.app_id,
            roles: claims.roles,
        })
    }

    /// Mint a token for `identity`; used by tests standing in for the session service.
    #[cfg(test)]
    pub fn issue(&self, identity: &CallerIdentity, ttl: Duration) -> String {
        use jsonwebtoken::{EncodingKey, Header, encode};

        let exp = chrono::Utc::now().timestamp() as u64 + ttl.as_secs();
        let claims = Claims {
            sub: identity.user_id.clone(),
            app_id: identity.app_id.clone(),
            roles: identity.roles.clone(),
            exp,
            iss: self.config.issuer.clone(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .expect("encode test token")
    }
}

/// Resolve `Authorization: Bearer` into a [`CallerIdentity`] extension.
///
/// Requests without the header pass through anonymously; handlers that need an
/// identity reject them through the extractor.
pub async fn identity_middleware(
    State(verifier): State<Arc<JwtVerifier>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(value) = req.headers().get(header::AUTHORIZATION) else {
        return Ok(next.run(req).await);
    };
    let token = value
        .to_str()
        .ok()
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .ok_or_else(|| {
            AppError::new(StatusCode::UNAUTHORIZED, "invalid authorization header format")
        })?;

    let identity = verifier.verify(token.trim())?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CallerIdentity>()
            .cloned()
            .ok_or_else(|| GatewayError::Unauthorized.into())
    }
}

fn client_ip(parts: &Parts) -> Option<String> {
    let forwarded = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let real_ip = || {
        parts
            .headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
    };
    let peer = || {
        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    };
    forwarded.or_else(real_ip).or_else(peer)
}

impl<S> FromRequestParts<S> for RequestSnapshot
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = parts
            .headers
            .iter()
            .filter(|(name, _)| *name != header::AUTHORIZATION && *name != header::COOKIE)
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(RequestSnapshot {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            headers,
            client_ip: client_ip(parts),
        })
    }
}
