//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use time::OffsetDateTime;

use super::{jwt::JwtManager, revocation::DynRevocationList};

/// Authenticated caller, inserted into request extensions by [`require_auth`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: i64,
    pub email: String,
}

/// The bearer token the caller authenticated with. Needed to revoke it at logout.
#[derive(Debug, Clone)]
pub struct PresentedToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub revocations: DynRevocationList,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Token has been revoked")]
    TokenRevoked,
    #[error("Database error")]
    DatabaseError,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authorization header is required"),
            AuthError::InvalidAuthFormat => (
                StatusCode::UNAUTHORIZED,
                "Authorization format must be Bearer {token}",
            ),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::TokenRevoked => (StatusCode::UNAUTHORIZED, "Token has been revoked"),
            AuthError::DatabaseError | AuthError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Pull the token out of `Authorization: Bearer <token>`
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingAuth)?
        .to_str()
        .map_err(|_| AuthError::InvalidAuthFormat)?;

    match header.split_once(' ') {
        Some(("Bearer", token)) if !token.trim().is_empty() && !token.contains(' ') => Ok(token),
        _ => Err(AuthError::InvalidAuthFormat),
    }
}

/// Validate signature and expiry, then check the revocation list
pub async fn authenticate(
    auth_state: &AuthState,
    token: &str,
) -> Result<(AuthUser, PresentedToken), AuthError> {
    let claims = auth_state.jwt_manager.validate_token(token)?;

    let revoked = auth_state.revocations.is_revoked(token).await.map_err(|e| {
        tracing::error!(error = %e, "Revocation lookup failed");
        AuthError::DatabaseError
    })?;
    if revoked {
        tracing::warn!(user_id = claims.sub, "Revoked token presented");
        return Err(AuthError::TokenRevoked);
    }

    Ok((
        AuthUser {
            user_id: claims.sub,
            email: claims.email.clone(),
        },
        PresentedToken {
            token: token.to_string(),
            expires_at: claims.expires_at(),
        },
    ))
}

/// Middleware that requires a valid, unrevoked bearer token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let token = match extract_bearer_token(request.headers()) {
        Ok(token) => token.to_string(),
        Err(err) => {
            tracing::debug!(path = %path, error = %err, "require_auth: no usable bearer token");
            return err.into_response();
        }
    };

    match authenticate(&auth_state, &token).await {
        Ok((auth_user, presented)) => {
            tracing::debug!(
                path = %path,
                user_id = auth_user.user_id,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            request.extensions_mut().insert(presented);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}
