use axum::extract::Request;
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;

use clique_types::api::Claims;
use clique_types::models::UserSummary;

/// Verify a token issued by the external auth provider. This core never
/// issues tokens; it only resolves them to an identity.
pub fn verify_token(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

pub fn summary_of(claims: &Claims) -> UserSummary {
    UserSummary {
        id: claims.sub,
        username: claims.username.clone(),
        full_name: claims.full_name.clone(),
    }
}

/// Sockets authenticate with a `token` query parameter, verified before the
/// upgrade is accepted.
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

/// Extract and validate JWT from Authorization header.
pub async fn require_auth(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let secret =
        std::env::var("CLIQUE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());

    let claims = verify_token(&secret, token).ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
