//! Admin surface handlers: `POST/GET /admin/tokens`, revoke, validate.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

use crate::error::Error;
use crate::state::AppState;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Extract the `X-Admin-Token` header value, if present.
fn extract_admin_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(ADMIN_TOKEN_HEADER).and_then(|v| v.to_str().ok())
}

/// Require a valid admin token, unless the store is still in bootstrap mode.
async fn require_token_unless_bootstrap(state: &AppState, headers: &HeaderMap) -> Result<(), Error> {
    if state.admission.is_bootstrap().await? {
        return Ok(());
    }
    require_token(state, headers).await
}

/// Require a valid admin token unconditionally.
async fn require_token(state: &AppState, headers: &HeaderMap) -> Result<(), Error> {
    let provided = extract_admin_token(headers).ok_or(Error::Unauthorized)?;
    if state.admission.validate(provided).await? {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

#[derive(Serialize)]
struct TokenListEntry {
    id: i64,
    created_at: String,
    revoked_at: Option<String>,
}

/// `POST /admin/tokens` — mint a new token. Unauthenticated only while the
/// store is empty (bootstrap rule); otherwise requires a valid token.
pub async fn create_token(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_token_unless_bootstrap(&state, &headers).await {
        return e.into_response();
    }

    match state.admission.create_token().await {
        Ok(minted) => (
            axum::http::StatusCode::CREATED,
            Json(json!({ "id": minted.id, "token": minted.token_plaintext })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// `GET /admin/tokens` — list every token record (never the hash or plaintext).
pub async fn list_tokens(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_token(&state, &headers).await {
        return e.into_response();
    }

    match state.admission.list().await {
        Ok(tokens) => {
            let entries: Vec<TokenListEntry> = tokens
                .into_iter()
                .map(|t| TokenListEntry {
                    id: t.id,
                    created_at: t.created_at.to_rfc3339(),
                    revoked_at: t.revoked_at.map(|d| d.to_rfc3339()),
                })
                .collect();
            Json(entries).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// `POST /admin/tokens/{id}/revoke` — permanently revoke a token by id.
pub async fn revoke_token(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = require_token(&state, &headers).await {
        return e.into_response();
    }

    match state.admission.revoke(id).await {
        Ok(token) => Json(json!({
            "id": token.id,
            "revoked_at": token.revoked_at.map(|d| d.to_rfc3339()),
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// `POST /admin/validate` — report whether the presented header token is valid.
pub async fn validate_token(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(provided) = extract_admin_token(&headers) else {
        return Error::Unauthorized.into_response();
    };

    match state.admission.validate(provided).await {
        Ok(ok) => Json(json!({ "ok": ok })).into_response(),
        Err(e) => e.into_response(),
    }
}
