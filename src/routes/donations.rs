use std::str::FromStr;

use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::auth::AuthenticatedUser;
use crate::db::{
    self,
    models::{Donation, DonationKind, DonationStatus, Location, NotificationKind, Role, UserSummary},
    DonationFilter, DonationUpdate, NewDonation, NewNotification,
};
use crate::error::{ApiError, ApiResponse, ApiResult, Envelope};
use crate::geo::{self, Coordinates};
use crate::routes::notifications::{notify, notify_rejected_requests};
use crate::routes::ValidJson;
use crate::AppState;

const MAX_IMAGES: usize = 10;

/// A donation as the API shows it: the stored document plus who is involved,
/// whether it has spoiled, and how far away it is for location searches.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DonationView {
    #[serde(flatten)]
    pub donation: Donation,
    pub donor: Option<UserSummary>,
    pub claimant: Option<UserSummary>,
    pub is_expired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
}

pub(crate) async fn present(state: &AppState, donations: Vec<(Donation, Option<f64>)>) -> anyhow::Result<Vec<DonationView>> {
    let mut ids: Vec<String> = donations
        .iter()
        .flat_map(|(d, _)| std::iter::once(d.donor_id.clone()).chain(d.claimed_by.clone()))
        .collect();
    ids.sort();
    ids.dedup();
    let users = db::user_summaries(&state.db, ids).await?;

    let now = Utc::now();
    Ok(donations
        .into_iter()
        .map(|(donation, distance)| DonationView {
            donor: users.get(&donation.donor_id).cloned(),
            claimant: donation.claimed_by.as_ref().and_then(|id| users.get(id).cloned()),
            is_expired: donation.is_expired(now),
            distance,
            donation,
        })
        .collect())
}

async fn present_one(state: &AppState, donation: Donation) -> Result<DonationView, ApiError> {
    present(state, vec![(donation, None)])
        .await?
        .pop()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("presenting a donation yielded nothing")))
}

async fn load_donation(state: &AppState, id: &str) -> Result<Donation, ApiError> {
    db::get_donation(&state.db, id).await?.ok_or_else(|| ApiError::not_found("Donation"))
}

/// Loads a donation the caller must own; `action` names the attempted verb in the 403.
async fn load_owned(state: &AppState, id: &str, user: &AuthenticatedUser, action: &str) -> Result<Donation, ApiError> {
    let donation = load_donation(state, id).await?;
    if donation.donor_id != user.id {
        return Err(ApiError::forbidden(format!("Not authorized to {action} this donation")));
    }
    Ok(donation)
}

fn parse_param<T: FromStr>(name: &str, raw: Option<&str>) -> Result<Option<T>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("Invalid {name}: {value}"))),
    }
}

fn check_location(location: &Location) -> Result<(), ApiError> {
    if location.address.trim().is_empty() {
        return Err(ApiError::bad_request("Address is required"));
    }
    if !location.coordinates.is_valid() {
        return Err(ApiError::bad_request("Coordinates are out of range"));
    }
    Ok(())
}

fn check_images(images: &[String]) -> Result<(), ApiError> {
    if images.len() > MAX_IMAGES {
        return Err(ApiError::bad_request(format!("At most {MAX_IMAGES} images are allowed")));
    }
    if images.iter().any(|url| !(url.starts_with("https://") || url.starts_with("http://"))) {
        return Err(ApiError::bad_request("Images must be http(s) URLs"));
    }
    Ok(())
}

fn check_expiry(expiry_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<(), ApiError> {
    if expiry_time.is_some_and(|t| t <= now) {
        return Err(ApiError::bad_request("Expiry time must be in the future"));
    }
    Ok(())
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateDonationRequest {
    #[serde(rename = "type")]
    pub kind: DonationKind,
    #[validate(length(min = 1, max = 200, message = "Item name is required"))]
    pub item_name: String,
    #[validate(range(min = 1, max = 1_000_000, message = "Quantity must be between 1 and 1000000"))]
    pub quantity: i64,
    pub description: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    pub location: Location,
    pub expiry_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Validate, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDonationRequest {
    #[validate(length(min = 1, max = 200, message = "Item name cannot be empty"))]
    pub item_name: Option<String>,
    #[validate(range(min = 1, max = 1_000_000, message = "Quantity must be between 1 and 1000000"))]
    pub quantity: Option<i64>,
    pub description: Option<String>,
    pub images: Option<Vec<String>>,
    pub location: Option<Location>,
    pub expiry_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Default)]
pub struct ListParams {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub status: Option<String>,
    pub lat: Option<String>,
    pub lng: Option<String>,
    pub radius: Option<String>,
}

pub async fn create_donation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ValidJson(req): ValidJson<CreateDonationRequest>,
) -> ApiResult<DonationView> {
    user.require_role(&[Role::Donor])?;

    let now = Utc::now();
    if req.item_name.trim().is_empty() {
        return Err(ApiError::bad_request("Item name is required"));
    }
    if req.kind == DonationKind::Food && req.expiry_time.is_none() {
        return Err(ApiError::bad_request("Expiry time is required for food donations"));
    }
    check_expiry(req.expiry_time, now)?;
    check_location(&req.location)?;
    check_images(&req.images)?;

    let new_donation = NewDonation {
        kind: req.kind,
        item_name: req.item_name,
        quantity: req.quantity,
        description: req.description,
        images: req.images,
        location: req.location,
        expiry_time: req.expiry_time,
    };
    let donation = db::create_donation(&state.db, &user.id, new_donation, now).await?;
    tracing::info!("Donation {} posted by {}", donation.id, user.id);

    notify(
        &state,
        NewNotification {
            user_id: user.id.clone(),
            kind: NotificationKind::DonationPosted,
            message: format!("Your donation \"{}\" is now live", donation.item_name),
            related_donation: Some(donation.id.clone()),
            related_user: None,
        },
    )
    .await;
    db::record_audit(&state.db, &user.id, "create", "donations", &donation.id, None).await;

    let view = present_one(&state, donation).await?;
    Ok(ApiResponse::created(Envelope::with_message(view, "Donation created successfully")))
}

pub async fn list_donations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<DonationView>> {
    let kind = parse_param::<DonationKind>("type", params.kind.as_deref())?;
    let status = parse_param::<DonationStatus>("status", params.status.as_deref())?
        .unwrap_or(DonationStatus::Available);
    let lat = parse_param::<f64>("lat", params.lat.as_deref())?;
    let lng = parse_param::<f64>("lng", params.lng.as_deref())?;

    let origin = match (lat, lng) {
        (Some(lat), Some(lng)) => {
            let origin = Coordinates::new(lat, lng);
            if !origin.is_valid() {
                return Err(ApiError::bad_request("Coordinates are out of range"));
            }
            Some(origin)
        }
        (None, None) => None,
        _ => return Err(ApiError::bad_request("Both lat and lng are required for a location search")),
    };

    let radius = parse_param::<f64>("radius", params.radius.as_deref())?
        .unwrap_or(state.config.default_search_radius_km);
    if radius.is_nan() || radius <= 0.0 {
        return Err(ApiError::bad_request("Radius must be positive"));
    }

    let donations = db::list_donations(&state.db, DonationFilter { kind, status: Some(status) }).await?;

    let ranked: Vec<(Donation, Option<f64>)> = match origin {
        Some(origin) => geo::within_radius(donations, &origin, radius, |d| d.location.coordinates)
            .into_iter()
            .map(|(d, distance)| (d, Some(distance)))
            .collect(),
        None => donations.into_iter().map(|d| (d, None)).collect(),
    };

    let views = present(&state, ranked).await?;
    Ok(ApiResponse::ok(Envelope::list(views)))
}

pub async fn get_donation(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<DonationView> {
    let donation = load_donation(&state, &id).await?;
    let view = present_one(&state, donation).await?;
    Ok(ApiResponse::ok(Envelope::data(view)))
}

/// Donors see what they posted, receivers what they claimed.
pub async fn my_donations(State(state): State<AppState>, user: AuthenticatedUser) -> ApiResult<Vec<DonationView>> {
    user.require_role(&[Role::Donor, Role::Receiver])?;

    let donations = match user.role {
        Role::Receiver => db::list_donations_claimed_by(&state.db, &user.id).await?,
        _ => db::list_donations_by_donor(&state.db, &user.id).await?,
    };
    let views = present(&state, donations.into_iter().map(|d| (d, None)).collect()).await?;
    Ok(ApiResponse::ok(Envelope::list(views)))
}

pub async fn update_donation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    ValidJson(req): ValidJson<UpdateDonationRequest>,
) -> ApiResult<DonationView> {
    user.require_role(&[Role::Donor])?;
    let donation = load_owned(&state, &id, &user, "update").await?;
    if donation.status != DonationStatus::Available {
        return Err(ApiError::bad_request("Cannot update donation in current status"));
    }

    if req.item_name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(ApiError::bad_request("Item name cannot be empty"));
    }
    let now = Utc::now();
    check_expiry(req.expiry_time, now)?;
    if let Some(location) = &req.location {
        check_location(location)?;
    }
    if let Some(images) = &req.images {
        check_images(images)?;
    }

    let update = DonationUpdate {
        item_name: req.item_name,
        quantity: req.quantity,
        description: req.description,
        images: req.images,
        location: req.location,
        expiry_time: req.expiry_time,
    };
    let Some(updated) = db::update_donation(&state.db, &user.id, &id, update, now).await? else {
        return Err(ApiError::conflict("Donation changed status while updating"));
    };
    db::record_audit(&state.db, &user.id, "update", "donations", &id, None).await;

    let view = present_one(&state, updated).await?;
    Ok(ApiResponse::ok(Envelope::with_message(view, "Donation updated successfully")))
}

pub async fn delete_donation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResult<()> {
    user.require_role(&[Role::Donor])?;
    let donation = load_owned(&state, &id, &user, "delete").await?;
    if matches!(donation.status, DonationStatus::InTransit | DonationStatus::Completed) {
        return Err(ApiError::bad_request("Cannot delete donation in current status"));
    }

    if !db::delete_donation(&state.db, &user.id, &id).await? {
        return Err(ApiError::conflict("Donation changed status while deleting"));
    }
    db::record_audit(
        &state.db,
        &user.id,
        "delete",
        "donations",
        &id,
        Some(format!("item={} status={}", donation.item_name, donation.status)),
    )
    .await;

    Ok(ApiResponse::ok(Envelope::message("Donation deleted successfully")))
}

pub async fn claim_donation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResult<DonationView> {
    user.require_role(&[Role::Receiver])?;
    let donation = load_donation(&state, &id).await?;
    let now = Utc::now();
    if donation.status != DonationStatus::Available {
        return Err(ApiError::bad_request("Donation is not available"));
    }
    if donation.is_expired(now) {
        return Err(ApiError::bad_request("Donation has expired"));
    }

    if !db::claim_donation(&state.db, &id, &user.id, now).await? {
        return Err(ApiError::conflict("Donation was just claimed by someone else"));
    }
    tracing::info!("Donation {} claimed by {}", id, user.id);

    notify(
        &state,
        NewNotification {
            user_id: donation.donor_id.clone(),
            kind: NotificationKind::DonationClaimed,
            message: format!("Your donation \"{}\" has been claimed by {}", donation.item_name, user.name),
            related_donation: Some(id.clone()),
            related_user: Some(user.id.clone()),
        },
    )
    .await;
    notify_rejected_requests(&state, &donation, now).await;
    db::record_audit(&state.db, &user.id, "claim", "donations", &id, None).await;

    let claimed = load_donation(&state, &id).await?;
    let view = present_one(&state, claimed).await?;
    Ok(ApiResponse::ok(Envelope::with_message(view, "Donation claimed successfully")))
}

pub async fn pickup_donation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResult<DonationView> {
    let donation = load_donation(&state, &id).await?;
    let involved = donation.donor_id == user.id || donation.claimed_by.as_deref() == Some(user.id.as_str());
    if !involved {
        return Err(ApiError::forbidden("Not authorized to pick up this donation"));
    }
    if !donation.status.can_transition_to(DonationStatus::InTransit) {
        return Err(ApiError::bad_request("Donation must be claimed to be picked up"));
    }

    if !db::transition_donation(&state.db, &id, DonationStatus::InTransit, Utc::now()).await? {
        return Err(ApiError::conflict("Donation changed status while picking up"));
    }
    db::record_audit(&state.db, &user.id, "pickup", "donations", &id, None).await;

    let moved = load_donation(&state, &id).await?;
    let view = present_one(&state, moved).await?;
    Ok(ApiResponse::ok(Envelope::with_message(view, "Donation marked as in transit")))
}

pub async fn complete_donation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResult<DonationView> {
    user.require_role(&[Role::Donor])?;
    let donation = load_owned(&state, &id, &user, "complete").await?;
    if !donation.status.can_transition_to(DonationStatus::Completed) {
        return Err(ApiError::bad_request("Donation must be claimed or in-transit to be completed"));
    }

    let Some(completed) = db::complete_donation(&state.db, &id, Utc::now()).await? else {
        return Err(ApiError::conflict("Donation changed status while completing"));
    };
    tracing::info!("Donation {} completed, donor {} credited {}", id, user.id, completed.quantity);

    if let Some(receiver) = &completed.claimed_by {
        notify(
            &state,
            NewNotification {
                user_id: receiver.clone(),
                kind: NotificationKind::DonationCompleted,
                message: format!("Donation \"{}\" has been marked as completed", completed.item_name),
                related_donation: Some(id.clone()),
                related_user: Some(user.id.clone()),
            },
        )
        .await;
    }
    db::record_audit(
        &state.db,
        &user.id,
        "complete",
        "donations",
        &id,
        Some(format!("quantity={}", completed.quantity)),
    )
    .await;

    let view = present_one(&state, completed).await?;
    Ok(ApiResponse::ok(Envelope::with_message(view, "Donation marked as completed")))
}

pub async fn cancel_donation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResult<DonationView> {
    user.require_role(&[Role::Donor])?;
    let donation = load_owned(&state, &id, &user, "cancel").await?;
    if !donation.status.can_transition_to(DonationStatus::Cancelled) {
        return Err(ApiError::bad_request("Cannot cancel donation in current status"));
    }

    let now = Utc::now();
    if !db::transition_donation(&state.db, &id, DonationStatus::Cancelled, now).await? {
        return Err(ApiError::conflict("Donation changed status while cancelling"));
    }

    if let Some(receiver) = &donation.claimed_by {
        notify(
            &state,
            NewNotification {
                user_id: receiver.clone(),
                kind: NotificationKind::DonationCancelled,
                message: format!("Donation \"{}\" has been cancelled by the donor", donation.item_name),
                related_donation: Some(id.clone()),
                related_user: Some(user.id.clone()),
            },
        )
        .await;
    }
    notify_rejected_requests(&state, &donation, now).await;
    db::record_audit(&state.db, &user.id, "cancel", "donations", &id, None).await;

    let cancelled = load_donation(&state, &id).await?;
    let view = present_one(&state, cancelled).await?;
    Ok(ApiResponse::ok(Envelope::with_message(view, "Donation cancelled")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_params_are_absent() {
        assert_eq!(parse_param::<f64>("lat", None).unwrap(), None);
        assert_eq!(parse_param::<f64>("lat", Some("  ")).unwrap(), None);
        assert_eq!(parse_param::<f64>("lat", Some("18.5")).unwrap(), Some(18.5));
    }

    #[test]
    fn bad_params_are_rejected() {
        let err = parse_param::<DonationKind>("type", Some("toys")).unwrap_err();
        assert_eq!(err.to_string(), "Invalid type: toys");
        assert!(parse_param::<DonationStatus>("status", Some("expired")).is_err());
    }

    #[test]
    fn images_must_be_urls() {
        assert!(check_images(&["https://cdn.example.org/a.jpg".to_string()]).is_ok());
        assert!(check_images(&["file:///etc/passwd".to_string()]).is_err());
        assert!(check_images(&vec!["https://x/y.png".to_string(); MAX_IMAGES + 1]).is_err());
    }

    #[test]
    fn expiry_must_be_ahead() {
        let now = Utc::now();
        assert!(check_expiry(None, now).is_ok());
        assert!(check_expiry(Some(now + chrono::Duration::hours(2)), now).is_ok());
        assert!(check_expiry(Some(now), now).is_err());
    }

    #[test]
    fn location_needs_address_and_valid_coordinates() {
        let mut location = Location {
            address: "12 MG Road".into(),
            coordinates: Coordinates::new(12.97, 77.59),
        };
        assert!(check_location(&location).is_ok());
        location.coordinates.lat = 123.0;
        assert!(check_location(&location).is_err());
        location.coordinates.lat = 12.97;
        location.address = "   ".into();
        assert!(check_location(&location).is_err());
    }
}
