use axum::{
    extract::{Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};

use crate::auth::AuthenticatedUser;
use crate::db::{self, models::Role};
use crate::error::ApiError;
use crate::AppState;

const DONATION_HEADERS: [&str; 13] = [
    "id",
    "type",
    "item_name",
    "quantity",
    "status",
    "address",
    "lat",
    "lng",
    "expiry_time",
    "claimed_by",
    "claimed_at",
    "completed_at",
    "created_at",
];

const AUDIT_HEADERS: [&str; 7] = ["id", "user_id", "action", "table_name", "record_id", "details", "created_at"];

fn timestamp(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_default()
}

fn csv_response(body: Vec<u8>, filename: &'static str) -> Response {
    let mut resp = Response::new(body.into());
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/csv; charset=utf-8"));
    if let Ok(disposition) = HeaderValue::from_str(&format!("attachment; filename={filename}")) {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    resp
}

fn finish(writer: csv::Writer<Vec<u8>>) -> anyhow::Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flushing CSV failed: {}", e.error()))
}

/// Donors export what they posted, receivers what they claimed.
pub async fn export_donations_csv(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Response, ApiError> {
    user.require_role(&[Role::Donor, Role::Receiver])?;
    let list = match user.role {
        Role::Receiver => db::list_donations_claimed_by(&state.db, &user.id).await?,
        _ => db::list_donations_by_donor(&state.db, &user.id).await?,
    };

    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(DONATION_HEADERS).map_err(anyhow::Error::from)?;
    for d in list {
        w.write_record([
            d.id,
            d.kind.to_string(),
            d.item_name,
            d.quantity.to_string(),
            d.status.to_string(),
            d.location.address,
            d.location.coordinates.lat.to_string(),
            d.location.coordinates.lng.to_string(),
            timestamp(d.expiry_time),
            d.claimed_by.unwrap_or_default(),
            timestamp(d.claimed_at),
            timestamp(d.completed_at),
            d.created_at.to_rfc3339(),
        ])
        .map_err(anyhow::Error::from)?;
    }

    Ok(csv_response(finish(w)?, "donations.csv"))
}

#[derive(serde::Deserialize)]
pub struct AuditExportParams {
    pub since: Option<String>,
}

pub async fn export_audit_csv(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<AuditExportParams>,
) -> Result<impl IntoResponse, ApiError> {
    user.require_role(&[Role::Admin])?;
    let since = match params.since.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|_| ApiError::bad_request(format!("Invalid since timestamp: {raw}")))?
                .with_timezone(&Utc),
        ),
    };

    let list = db::list_audit_logs(&state.db, since).await?;
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(AUDIT_HEADERS).map_err(anyhow::Error::from)?;
    for a in list {
        w.write_record([
            a.id,
            a.user_id,
            a.action,
            a.table_name,
            a.record_id.unwrap_or_default(),
            a.details.unwrap_or_default(),
            a.created_at.to_rfc3339(),
        ])
        .map_err(anyhow::Error::from)?;
    }

    Ok(csv_response(finish(w)?, "audit_logs.csv"))
}
