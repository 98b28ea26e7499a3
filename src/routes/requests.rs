use axum::extract::{Path, State};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::auth::AuthenticatedUser;
use crate::db::{
    self,
    models::{Donation, DonationRequest, DonationStatus, NotificationKind, RequestStatus, Role, UserSummary},
    AcceptOutcome, NewNotification,
};
use crate::error::{ApiError, ApiResponse, ApiResult, Envelope};
use crate::routes::notifications::notify;
use crate::routes::ValidJson;
use crate::AppState;

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RequestView {
    #[serde(flatten)]
    pub request: DonationRequest,
    pub receiver: Option<UserSummary>,
}

async fn present(state: &AppState, requests: Vec<DonationRequest>) -> anyhow::Result<Vec<RequestView>> {
    let mut ids: Vec<String> = requests.iter().map(|r| r.receiver_id.clone()).collect();
    ids.sort();
    ids.dedup();
    let users = db::user_summaries(&state.db, ids).await?;
    Ok(requests
        .into_iter()
        .map(|request| RequestView {
            receiver: users.get(&request.receiver_id).cloned(),
            request,
        })
        .collect())
}

#[derive(Deserialize, Validate, Default)]
pub struct CreateRequestBody {
    #[validate(length(max = 500, message = "Message must be at most 500 characters"))]
    pub message: Option<String>,
}

async fn load_donation(state: &AppState, id: &str) -> Result<Donation, ApiError> {
    db::get_donation(&state.db, id).await?.ok_or_else(|| ApiError::not_found("Donation"))
}

/// Loads a still-pending request and its donation for the donor who posted it.
async fn load_for_donor(
    state: &AppState,
    id: &str,
    user: &AuthenticatedUser,
) -> Result<(DonationRequest, Donation), ApiError> {
    let request = db::get_request(&state.db, id).await?.ok_or_else(|| ApiError::not_found("Request"))?;
    let donation = load_donation(state, &request.donation_id).await?;
    if donation.donor_id != user.id {
        return Err(ApiError::forbidden("Not authorized to manage requests for this donation"));
    }
    if request.status != RequestStatus::Pending {
        return Err(ApiError::bad_request("Request has already been decided"));
    }
    Ok((request, donation))
}

pub async fn create_request(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(donation_id): Path<String>,
    ValidJson(body): ValidJson<CreateRequestBody>,
) -> ApiResult<DonationRequest> {
    user.require_role(&[Role::Receiver])?;
    let donation = load_donation(&state, &donation_id).await?;
    let now = Utc::now();
    if donation.status != DonationStatus::Available {
        return Err(ApiError::bad_request("Donation is not available"));
    }
    if donation.is_expired(now) {
        return Err(ApiError::bad_request("Donation has expired"));
    }

    let message = body.message.map(|m| m.trim().to_string()).filter(|m| !m.is_empty());
    let Some(request) = db::create_request(&state.db, &user.id, &donation_id, message, now).await? else {
        return Err(ApiError::conflict("You already have a pending request for this donation"));
    };

    notify(
        &state,
        NewNotification {
            user_id: donation.donor_id.clone(),
            kind: NotificationKind::RequestReceived,
            message: format!("{} requested your donation \"{}\"", user.name, donation.item_name),
            related_donation: Some(donation_id.clone()),
            related_user: Some(user.id.clone()),
        },
    )
    .await;
    db::record_audit(&state.db, &user.id, "create", "requests", &request.id, None).await;

    Ok(ApiResponse::created(Envelope::with_message(request, "Request sent")))
}

/// Donors see every request on their donation; receivers only their own.
pub async fn list_for_donation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(donation_id): Path<String>,
) -> ApiResult<Vec<RequestView>> {
    let donation = load_donation(&state, &donation_id).await?;
    let mut requests = db::list_requests_for_donation(&state.db, &donation_id).await?;
    match user.role {
        Role::Admin => {}
        Role::Donor if donation.donor_id == user.id => {}
        Role::Receiver => requests.retain(|r| r.receiver_id == user.id),
        Role::Donor => return Err(ApiError::forbidden("Not authorized to view requests for this donation")),
    }
    let views = present(&state, requests).await?;
    Ok(ApiResponse::ok(Envelope::list(views)))
}

pub async fn my_requests(State(state): State<AppState>, user: AuthenticatedUser) -> ApiResult<Vec<DonationRequest>> {
    user.require_role(&[Role::Receiver])?;
    let requests = db::list_requests_by_receiver(&state.db, &user.id).await?;
    Ok(ApiResponse::ok(Envelope::list(requests)))
}

pub async fn accept_request(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResult<DonationRequest> {
    user.require_role(&[Role::Donor])?;
    let (_, donation) = load_for_donor(&state, &id, &user).await?;
    let now = Utc::now();
    if donation.status != DonationStatus::Available {
        return Err(ApiError::bad_request("Donation is not available"));
    }
    if donation.is_expired(now) {
        return Err(ApiError::bad_request("Donation has expired"));
    }

    let (request, rejected_receivers) = match db::accept_request(&state.db, &id, now).await? {
        AcceptOutcome::Accepted {
            request,
            rejected_receivers,
        } => (request, rejected_receivers),
        AcceptOutcome::NotPending => return Err(ApiError::conflict("Request was decided concurrently")),
        AcceptOutcome::DonationUnavailable => {
            return Err(ApiError::conflict("Donation was just claimed by someone else"))
        }
    };
    tracing::info!("Request {} accepted, donation {} claimed", id, donation.id);

    notify(
        &state,
        NewNotification {
            user_id: request.receiver_id.clone(),
            kind: NotificationKind::RequestAccepted,
            message: format!("Your request for \"{}\" was accepted", donation.item_name),
            related_donation: Some(donation.id.clone()),
            related_user: Some(user.id.clone()),
        },
    )
    .await;
    for receiver in rejected_receivers {
        notify(
            &state,
            NewNotification {
                user_id: receiver,
                kind: NotificationKind::RequestRejected,
                message: format!("Your request for \"{}\" was declined", donation.item_name),
                related_donation: Some(donation.id.clone()),
                related_user: Some(user.id.clone()),
            },
        )
        .await;
    }
    db::record_audit(&state.db, &user.id, "accept", "requests", &id, Some(format!("donation={}", donation.id))).await;

    Ok(ApiResponse::ok(Envelope::with_message(request, "Request accepted")))
}

pub async fn reject_request(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResult<DonationRequest> {
    user.require_role(&[Role::Donor])?;
    let (_, donation) = load_for_donor(&state, &id, &user).await?;

    let Some(request) = db::reject_request(&state.db, &id, Utc::now()).await? else {
        return Err(ApiError::conflict("Request was decided concurrently"));
    };

    notify(
        &state,
        NewNotification {
            user_id: request.receiver_id.clone(),
            kind: NotificationKind::RequestRejected,
            message: format!("Your request for \"{}\" was declined", donation.item_name),
            related_donation: Some(donation.id.clone()),
            related_user: Some(user.id.clone()),
        },
    )
    .await;
    db::record_audit(&state.db, &user.id, "reject", "requests", &id, None).await;

    Ok(ApiResponse::ok(Envelope::with_message(request, "Request rejected")))
}
