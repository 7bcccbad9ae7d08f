use axum::{
    body::Body,
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{instrument, warn};

use crate::http::error::ApiError;

/// Bearer token guarding the admin API. An empty token locks it entirely.
///
/// Only the SHA-256 digest is kept; presented tokens are hashed before the
/// comparison so its duration does not depend on either token's length.
#[derive(Clone)]
pub struct AdminToken(Option<[u8; 32]>);

impl std::fmt::Debug for AdminToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AdminToken(..)")
    }
}

impl AdminToken {
    pub fn new(token: &str) -> Self {
        let token = token.trim();
        Self((!token.is_empty()).then(|| digest(token)))
    }

    fn accepts(&self, presented: &str) -> bool {
        self.0
            .is_some_and(|expected| bool::from(expected[..].ct_eq(&digest(presented)[..])))
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

fn bearer(request: &Request<Body>) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn require_admin_token(
    State(token): State<AdminToken>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    match bearer(&request) {
        Some(presented) if token.accepts(presented) => Ok(next.run(request).await),
        _ => {
            warn!("rejected admin request");
            Err(ApiError::unauthorized("a valid admin bearer token is required"))
        }
    }
}
