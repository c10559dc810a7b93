//! Account registration, sign-in and token lifecycle

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    accounts::{Account, NewAccount},
    auth::{
        hash_password, new_reset_token, reset_token_digest, validate_password_strength,
        verify_password, AuthUser, PresentedToken, RESET_TOKEN_TTL,
    },
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SignUpRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date_of_birth: OffsetDateTime,
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub message: String,
    pub user: Account,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub message: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct ForgotPasswordResponse {
    pub message: String,
    /// Echoed only outside production, where no email goes out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

/// Unwrap a JSON body, reporting rejections in the API error shape
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

impl SignUpRequest {
    fn validate(&self) -> ApiResult<()> {
        if self.name.trim().is_empty() {
            return Err(ApiError::BadRequest("name is required".to_string()));
        }
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') || email.starts_with('@') || email.ends_with('@')
        {
            return Err(ApiError::BadRequest("a valid email is required".to_string()));
        }
        validate_password_strength(&self.password).map_err(ApiError::BadRequest)
    }
}

pub async fn signup(
    State(state): State<AppState>,
    payload: Result<Json<SignUpRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    let req = json_body(payload)?;
    req.validate()?;

    let password_hash = hash_password(&req.password)?;
    let account = state
        .accounts
        .create(NewAccount {
            name: req.name.trim().to_string(),
            email: normalize_email(&req.email),
            password_hash,
            date_of_birth: Some(req.date_of_birth.date()),
            mobile: non_empty(req.mobile),
            country_code: non_empty(req.country_code),
            address: non_empty(req.address),
            city: non_empty(req.city),
            country: non_empty(req.country),
            postal_code: non_empty(req.postal_code),
        })
        .await?;

    let issued = state.jwt_manager.generate_token(account.id, &account.email)?;
    tracing::info!(user_id = account.id, "Account registered");

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            message: "User registered successfully".to_string(),
            user: account,
            token: Some(issued.token),
        }),
    ))
}

pub async fn signin(
    State(state): State<AppState>,
    payload: Result<Json<SignInRequest>, JsonRejection>,
) -> ApiResult<Json<AuthResponse>> {
    let req = json_body(payload)?;
    let invalid = || ApiError::Unauthorized("Invalid email or password".to_string());

    let credentials = state
        .accounts
        .find_by_email(&normalize_email(&req.email))
        .await?
        .ok_or_else(invalid)?;

    if !verify_password(&req.password, &credentials.password_hash) {
        tracing::info!(user_id = credentials.id, "Sign-in rejected: wrong password");
        return Err(invalid());
    }

    let issued = state
        .jwt_manager
        .generate_token(credentials.id, &credentials.email)?;

    if let Err(e) = state.accounts.record_login(credentials.id).await {
        tracing::warn!(user_id = credentials.id, error = %e, "Failed to update last login time");
    }

    Ok(Json(AuthResponse {
        message: "Login successful".to_string(),
        user: credentials.account(),
        token: Some(issued.token),
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Extension(presented): Extension<PresentedToken>,
) -> ApiResult<Json<MessageResponse>> {
    state
        .revocations
        .revoke(&presented.token, presented.expires_at)
        .await?;
    tracing::info!(user_id = user.user_id, "Logged out");

    Ok(Json(MessageResponse {
        message: "Logged out successfully".to_string(),
    }))
}

/// Issue a fresh token and revoke the one presented
pub async fn refresh(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Extension(presented): Extension<PresentedToken>,
) -> ApiResult<Json<TokenResponse>> {
    let account = state
        .accounts
        .find_by_id(user.user_id)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("User not found".to_string()))?;

    let issued = state.jwt_manager.generate_token(account.id, &account.email)?;
    state
        .revocations
        .revoke(&presented.token, presented.expires_at)
        .await?;

    Ok(Json(TokenResponse {
        message: "Token refreshed successfully".to_string(),
        token: issued.token,
    }))
}

pub async fn check(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<AuthResponse>> {
    let account = state
        .accounts
        .find_by_id(user.user_id)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("User not found".to_string()))?;

    Ok(Json(AuthResponse {
        message: "User authentication status".to_string(),
        user: account,
        token: None,
    }))
}

/// Issue a single-use reset token for the account
pub async fn forgot_password(
    State(state): State<AppState>,
    payload: Result<Json<ForgotPasswordRequest>, JsonRejection>,
) -> ApiResult<Json<ForgotPasswordResponse>> {
    let req = json_body(payload)?;
    let credentials = state
        .accounts
        .find_by_email(&normalize_email(&req.email))
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    let token = new_reset_token();
    let expires_at = OffsetDateTime::now_utc() + RESET_TOKEN_TTL;
    state
        .accounts
        .create_password_reset(credentials.id, &reset_token_digest(&token), expires_at)
        .await?;
    tracing::info!(user_id = credentials.id, "Password reset token issued");

    Ok(Json(ForgotPasswordResponse {
        message: "Password reset instructions sent to your email".to_string(),
        reset_token: (!state.config.is_production()).then_some(token),
    }))
}

pub async fn reset_password(
    State(state): State<AppState>,
    payload: Result<Json<ResetPasswordRequest>, JsonRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let req = json_body(payload)?;
    validate_password_strength(&req.password).map_err(ApiError::BadRequest)?;
    // Hash before consuming so a failure here leaves the token usable
    let password_hash = hash_password(&req.password)?;

    let user_id = state
        .accounts
        .consume_password_reset(&reset_token_digest(req.token.trim()))
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Invalid or expired reset token".to_string()))?;

    state.accounts.set_password(user_id, &password_hash).await?;
    tracing::info!(user_id = user_id, "Password reset");

    Ok(Json(MessageResponse {
        message: "Password reset successful".to_string(),
    }))
}
