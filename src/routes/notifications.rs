use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::auth::AuthenticatedUser;
use crate::db::{
    self,
    models::{Donation, Notification, NotificationKind},
    NewNotification,
};
use crate::error::{ApiError, ApiResponse, ApiResult, Envelope};
use crate::AppState;

/// Notifications are side effects: a failed insert is logged, never surfaced
/// to the caller whose action triggered it.
pub(crate) async fn notify(state: &AppState, notification: NewNotification) {
    let user_id = notification.user_id.clone();
    let kind = notification.kind;
    if let Err(e) = db::create_notification(&state.db, notification, Utc::now()).await {
        tracing::warn!("Failed to notify {} ({}): {}", user_id, kind, e);
    }
}

/// Closes pending requests on a donation that just left `available` and tells
/// each affected receiver.
pub(crate) async fn notify_rejected_requests(state: &AppState, donation: &Donation, now: DateTime<Utc>) {
    let receivers = match db::reject_pending_for_donation(&state.db, &donation.id, now).await {
        Ok(receivers) => receivers,
        Err(e) => {
            tracing::warn!("Failed to close pending requests for {}: {}", donation.id, e);
            return;
        }
    };
    for receiver in receivers {
        notify(
            state,
            NewNotification {
                user_id: receiver,
                kind: NotificationKind::RequestRejected,
                message: format!(
                    "Your request for \"{}\" was declined because it is no longer available",
                    donation.item_name
                ),
                related_donation: Some(donation.id.clone()),
                related_user: Some(donation.donor_id.clone()),
            },
        )
        .await;
    }
}

#[derive(Deserialize, Default)]
pub struct ListParams {
    pub read: Option<String>,
}

fn parse_read(raw: Option<&str>) -> Result<Option<bool>, ApiError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some("true") => Ok(Some(true)),
        Some("false") => Ok(Some(false)),
        Some(other) => Err(ApiError::bad_request(format!("Invalid read filter: {other}"))),
    }
}

async fn load_own(state: &AppState, id: &str, user: &AuthenticatedUser) -> Result<Notification, ApiError> {
    let notification = db::get_notification(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Notification"))?;
    if notification.user_id != user.id {
        return Err(ApiError::forbidden("Not authorized to access this notification"));
    }
    Ok(notification)
}

pub async fn list_notifications(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<Notification>> {
    let read = parse_read(params.read.as_deref())?;
    let notifications = db::list_notifications(&state.db, &user.id, read).await?;
    let unread = db::count_unread(&state.db, &user.id).await?;

    let mut envelope = Envelope::list(notifications);
    envelope.unread_count = Some(unread);
    Ok(ApiResponse::ok(envelope))
}

pub async fn mark_read(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResult<Notification> {
    let mut notification = load_own(&state, &id, &user).await?;
    if !notification.read {
        if !db::mark_notification_read(&state.db, &id).await? {
            return Err(ApiError::not_found("Notification"));
        }
        notification.read = true;
    }
    Ok(ApiResponse::ok(Envelope::with_message(notification, "Notification marked as read")))
}

pub async fn mark_all_read(State(state): State<AppState>, user: AuthenticatedUser) -> ApiResult<()> {
    let updated = db::mark_all_read(&state.db, &user.id).await?;
    tracing::debug!("Marked {} notifications read for {}", updated, user.id);
    Ok(ApiResponse::ok(Envelope::message("All notifications marked as read")))
}

pub async fn delete_notification(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResult<()> {
    load_own(&state, &id, &user).await?;
    if !db::delete_notification(&state.db, &id).await? {
        return Err(ApiError::not_found("Notification"));
    }
    Ok(ApiResponse::ok(Envelope::message("Notification deleted")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_filter_parsing() {
        assert_eq!(parse_read(None).unwrap(), None);
        assert_eq!(parse_read(Some("")).unwrap(), None);
        assert_eq!(parse_read(Some("true")).unwrap(), Some(true));
        assert_eq!(parse_read(Some("false")).unwrap(), Some(false));
        assert!(parse_read(Some("yes")).is_err());
    }
}
