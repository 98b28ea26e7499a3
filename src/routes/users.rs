use axum::extract::{Path, Query, State};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatedUser;
use crate::db::{
    self,
    models::{PublicProfile, Role, User},
    AdminStats, DonorStats, ReceiverStats,
};
use crate::error::{ApiError, ApiResponse, ApiResult, Envelope};
use crate::AppState;

#[derive(Deserialize, Default)]
pub struct ListParams {
    pub role: Option<String>,
    pub verified: Option<String>,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
pub enum UserStats {
    Donor(DonorStats),
    Receiver(ReceiverStats),
    Admin(AdminStats),
}

pub async fn list_users(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<User>> {
    user.require_role(&[Role::Admin])?;

    let role = match params.role.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => Some(
            raw.parse::<Role>()
                .map_err(|_| ApiError::bad_request(format!("Invalid role: {raw}")))?,
        ),
    };
    let verified = match params.verified.as_deref().map(str::trim) {
        None | Some("") => None,
        Some("true") => Some(true),
        Some("false") => Some(false),
        Some(other) => return Err(ApiError::bad_request(format!("Invalid verified filter: {other}"))),
    };

    let users = db::list_users(&state.db, role, verified).await?;
    Ok(ApiResponse::ok(Envelope::list(users)))
}

pub async fn stats(State(state): State<AppState>, user: AuthenticatedUser) -> ApiResult<UserStats> {
    let stats = match user.role {
        Role::Donor => UserStats::Donor(db::donor_stats(&state.db, &user.id).await?),
        Role::Receiver => UserStats::Receiver(db::receiver_stats(&state.db, &user.id).await?),
        Role::Admin => UserStats::Admin(db::admin_stats(&state.db).await?),
    };
    Ok(ApiResponse::ok(Envelope::data(stats)))
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
pub enum Profile {
    Full(User),
    Public(PublicProfile),
}

/// Contact details are only shown to the account holder and admins.
pub async fn profile(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResult<Profile> {
    let found = db::get_user(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("User"))?;
    let profile = if found.id == user.id || user.role == Role::Admin {
        Profile::Full(found)
    } else {
        Profile::Public(found.into())
    };
    Ok(ApiResponse::ok(Envelope::data(profile)))
}

pub async fn verify_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResult<User> {
    user.require_role(&[Role::Admin])?;
    let verified = db::verify_user(&state.db, &id, Utc::now())
        .await?
        .ok_or_else(|| ApiError::not_found("User"))?;
    tracing::info!("User {} verified by {}", id, user.id);
    db::record_audit(&state.db, &user.id, "verify", "users", &id, None).await;
    Ok(ApiResponse::ok(Envelope::with_message(verified, "User verified successfully")))
}
