use axum::{
    extract::{FromRequest, Request},
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Json, Router,
};
use serde::de::DeserializeOwned;
use tower_http::trace::TraceLayer;
use validator::Validate;

use crate::auth;
use crate::error::ApiError;
use crate::AppState;

pub mod donations;
pub mod notifications;
pub mod reports;
pub mod requests;
pub mod users;

/// `Json<T>` that also runs `T`'s validation rules, rejecting with the
/// standard error envelope instead of axum's plain-text body.
pub struct ValidJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned + Validate + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
        value.validate()?;
        Ok(ValidJson(value))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Auth
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/profile", put(auth::update_profile))
        // Donations
        .route("/api/donations", get(donations::list_donations).post(donations::create_donation))
        .route("/api/donations/my/donations", get(donations::my_donations))
        .route(
            "/api/donations/{id}",
            get(donations::get_donation)
                .put(donations::update_donation)
                .delete(donations::delete_donation),
        )
        .route("/api/donations/{id}/claim", post(donations::claim_donation))
        .route("/api/donations/{id}/pickup", put(donations::pickup_donation))
        .route("/api/donations/{id}/complete", put(donations::complete_donation))
        .route("/api/donations/{id}/cancel", put(donations::cancel_donation))
        .route(
            "/api/donations/{id}/requests",
            get(requests::list_for_donation).post(requests::create_request),
        )
        // Requests
        .route("/api/requests/mine", get(requests::my_requests))
        .route("/api/requests/{id}/accept", put(requests::accept_request))
        .route("/api/requests/{id}/reject", put(requests::reject_request))
        // Users
        .route("/api/users", get(users::list_users))
        .route("/api/users/stats", get(users::stats))
        .route("/api/users/profile/{id}", get(users::profile))
        .route("/api/users/verify/{id}", put(users::verify_user))
        // Notifications
        .route("/api/notifications", get(notifications::list_notifications))
        .route("/api/notifications/read-all", put(notifications::mark_all_read))
        .route("/api/notifications/{id}/read", put(notifications::mark_read))
        .route("/api/notifications/{id}", axum::routing::delete(notifications::delete_notification))
        // Reports
        .route("/api/reports/donations.csv", get(reports::export_donations_csv))
        .route("/api/reports/audit", get(reports::export_audit_csv))
        .fallback(not_found)
        .layer(from_fn_with_state(state.clone(), auth::require_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Route not found".to_string())
}
