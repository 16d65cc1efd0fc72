use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::AppState;

/// Roles allowed to operate the webhook retry and dead letter tooling.
pub const OPERATOR_ROLES: [&str; 2] = ["admin", "ops"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub role: Option<String>,
}

fn reject(status: StatusCode, code: &'static str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

/// Extracts the bearer token or the error code to reject the request with.
fn bearer_token(req: &Request) -> Result<&str, &'static str> {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .ok_or("missing_authorization")?;
    let value = header.to_str().map_err(|_| "bad_authorization")?;
    value.strip_prefix("Bearer ").ok_or("unsupported_scheme")
}

fn is_operator(claims: &Claims) -> bool {
    claims
        .role
        .as_deref()
        .is_some_and(|role| OPERATOR_ROLES.iter().any(|r| r.eq_ignore_ascii_case(role)))
}

/// Admin API guard: HS256 bearer token whose `role` is an operator role.
pub async fn require_operator(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = match bearer_token(&req) {
        Ok(token) => token,
        Err(code) => return reject(StatusCode::UNAUTHORIZED, code),
    };

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let claims = match decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => data.claims,
        Err(_) => return reject(StatusCode::UNAUTHORIZED, "invalid_token"),
    };

    if !is_operator(&claims) {
        tracing::warn!(sub = %claims.sub, role = ?claims.role, "non-operator token rejected");
        return reject(StatusCode::FORBIDDEN, "forbidden");
    }
    tracing::debug!(sub = %claims.sub, "operator authenticated");
    req.extensions_mut().insert(claims);
    next.run(req).await
}
