//! Self-service profile endpoints

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use super::auth::{json_body, non_empty};
use crate::{
    accounts::{ProfileUpdate, UserProfile},
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub name: Option<String>,
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

impl From<UpdateUserRequest> for ProfileUpdate {
    /// Blank values mean "leave unchanged"
    fn from(req: UpdateUserRequest) -> Self {
        ProfileUpdate {
            name: non_empty(req.name),
            mobile: non_empty(req.mobile),
            country_code: non_empty(req.country_code),
            address: non_empty(req.address),
            city: non_empty(req.city),
            country: non_empty(req.country),
            postal_code: non_empty(req.postal_code),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user: UserProfile,
}

#[derive(Debug, Serialize)]
pub struct UserUpdateResponse {
    pub message: String,
    pub user: UserProfile,
}

/// Accounts may only read and write their own profile
fn own_id(
    path: Result<Path<i64>, PathRejection>,
    user: &AuthUser,
    action: &str,
) -> ApiResult<i64> {
    let Path(id) = path.map_err(|_| ApiError::BadRequest("Invalid user ID".to_string()))?;
    if id != user.user_id {
        tracing::warn!(
            user_id = user.user_id,
            requested_id = id,
            "Refused access to another account's profile"
        );
        return Err(ApiError::Forbidden(format!(
            "You can only {action} your own profile"
        )));
    }
    Ok(id)
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<UserResponse>> {
    let id = own_id(path, &user, "view")?;
    let profile = state
        .accounts
        .find_profile(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    Ok(Json(UserResponse { user: profile }))
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> ApiResult<Json<UserUpdateResponse>> {
    let id = own_id(path, &user, "update")?;
    let update = ProfileUpdate::from(json_body(payload)?);

    let profile = state
        .accounts
        .update_profile(id, &update)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    tracing::info!(user_id = id, "Profile updated");

    Ok(Json(UserUpdateResponse {
        message: "User updated successfully".to_string(),
        user: profile,
    }))
}
