use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::donations::claim_in;
use super::models::{DonationRequest, DonationStatus, RequestStatus};
use super::{new_id, with_conn, DbPool};

const REQUEST_COLUMNS: &str = "id, receiver_id, donation_id, message, status, created_at, updated_at";

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<DonationRequest> {
    Ok(DonationRequest {
        id: row.get(0)?,
        receiver_id: row.get(1)?,
        donation_id: row.get(2)?,
        message: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn fetch_request(conn: &Connection, id: &str) -> rusqlite::Result<Option<DonationRequest>> {
    conn.query_row(
        &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
        [id],
        request_from_row,
    )
    .optional()
}

fn list_where(conn: &Connection, where_clause: &str, key: &str) -> anyhow::Result<Vec<DonationRequest>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REQUEST_COLUMNS} FROM requests WHERE {where_clause} ORDER BY created_at DESC, rowid DESC"
    ))?;
    let list = stmt
        .query_map([key], request_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(list)
}

/// Returns `None` when the receiver already has a pending request for this donation.
pub async fn create_request(
    pool: &DbPool,
    receiver_id: &str,
    donation_id: &str,
    message: Option<String>,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<DonationRequest>> {
    let receiver_id = receiver_id.to_string();
    let donation_id = donation_id.to_string();
    with_conn(pool, move |conn| {
        let tx = conn.transaction()?;
        let pending: i64 = tx.query_row(
            "SELECT COUNT(*) FROM requests WHERE receiver_id = ?1 AND donation_id = ?2 AND status = ?3",
            params![receiver_id, donation_id, RequestStatus::Pending],
            |row| row.get(0),
        )?;
        if pending > 0 {
            return Ok(None);
        }
        let id = new_id();
        tx.execute(
            "INSERT INTO requests (id, receiver_id, donation_id, message, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id, receiver_id, donation_id, message, RequestStatus::Pending, now],
        )?;
        let request = fetch_request(&tx, &id)?;
        tx.commit()?;
        Ok(request)
    })
    .await
}

pub async fn get_request(pool: &DbPool, id: &str) -> anyhow::Result<Option<DonationRequest>> {
    let id = id.to_string();
    with_conn(pool, move |conn| Ok(fetch_request(conn, &id)?)).await
}

pub async fn list_requests_for_donation(pool: &DbPool, donation_id: &str) -> anyhow::Result<Vec<DonationRequest>> {
    let donation_id = donation_id.to_string();
    with_conn(pool, move |conn| list_where(conn, "donation_id = ?1", &donation_id)).await
}

pub async fn list_requests_by_receiver(pool: &DbPool, receiver_id: &str) -> anyhow::Result<Vec<DonationRequest>> {
    let receiver_id = receiver_id.to_string();
    with_conn(pool, move |conn| list_where(conn, "receiver_id = ?1", &receiver_id)).await
}

#[derive(Debug)]
pub enum AcceptOutcome {
    Accepted {
        request: DonationRequest,
        /// Receivers whose competing pending requests were rejected.
        rejected_receivers: Vec<String>,
    },
    /// The request was no longer pending.
    NotPending,
    /// Someone else claimed the donation first.
    DonationUnavailable,
}

/// Accepting a request claims the donation for its receiver and rejects every
/// other pending request for the same donation, in one transaction.
pub async fn accept_request(pool: &DbPool, id: &str, now: DateTime<Utc>) -> anyhow::Result<AcceptOutcome> {
    let id = id.to_string();
    with_conn(pool, move |conn| {
        let tx = conn.transaction()?;
        let Some(request) = fetch_request(&tx, &id)? else {
            return Ok(AcceptOutcome::NotPending);
        };
        if request.status != RequestStatus::Pending {
            return Ok(AcceptOutcome::NotPending);
        }
        if !claim_in(&tx, &request.donation_id, &request.receiver_id, now)? {
            return Ok(AcceptOutcome::DonationUnavailable);
        }

        tx.execute(
            "UPDATE requests SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, RequestStatus::Accepted, now],
        )?;

        let rejected_receivers = {
            let mut stmt = tx.prepare(
                "SELECT receiver_id FROM requests WHERE donation_id = ?1 AND status = ?2 AND id != ?3",
            )?;
            let rows = stmt.query_map(params![request.donation_id, RequestStatus::Pending, id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()?
        };
        tx.execute(
            "UPDATE requests SET status = ?3, updated_at = ?4 WHERE donation_id = ?1 AND status = ?2",
            params![request.donation_id, RequestStatus::Pending, RequestStatus::Rejected, now],
        )?;

        let request = fetch_request(&tx, &id)?
            .ok_or_else(|| anyhow::anyhow!("request {} vanished during accept", id))?;
        tx.commit()?;
        Ok(AcceptOutcome::Accepted {
            request,
            rejected_receivers,
        })
    })
    .await
}

/// Pending -> rejected; `None` if the request is missing or already decided.
pub async fn reject_request(pool: &DbPool, id: &str, now: DateTime<Utc>) -> anyhow::Result<Option<DonationRequest>> {
    let id = id.to_string();
    with_conn(pool, move |conn| {
        let updated = conn.execute(
            "UPDATE requests SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
            params![id, RequestStatus::Rejected, now, RequestStatus::Pending],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        Ok(fetch_request(conn, &id)?)
    })
    .await
}

/// Donations that stopped being available leave their pending requests hanging;
/// this closes them and returns the affected receivers. A pending request from
/// the receiver who went on to claim the donation directly is accepted instead.
pub async fn reject_pending_for_donation(
    pool: &DbPool,
    donation_id: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<String>> {
    let donation_id = donation_id.to_string();
    with_conn(pool, move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE requests SET status = ?4, updated_at = ?5 \
             WHERE donation_id = ?1 AND status = ?2 \
               AND receiver_id = (SELECT claimed_by FROM donations WHERE id = ?1 AND status = ?3)",
            params![donation_id, RequestStatus::Pending, DonationStatus::Claimed, RequestStatus::Accepted, now],
        )?;
        let receivers = {
            let mut stmt = tx.prepare(
                "SELECT r.receiver_id FROM requests r JOIN donations d ON d.id = r.donation_id \
                 WHERE r.donation_id = ?1 AND r.status = ?2 AND d.status != ?3",
            )?;
            let rows = stmt.query_map(
                params![donation_id, RequestStatus::Pending, DonationStatus::Available],
                |row| row.get(0),
            )?;
            rows.collect::<rusqlite::Result<Vec<String>>>()?
        };
        if !receivers.is_empty() {
            tx.execute(
                "UPDATE requests SET status = ?3, updated_at = ?4 WHERE donation_id = ?1 AND status = ?2",
                params![donation_id, RequestStatus::Pending, RequestStatus::Rejected, now],
            )?;
        }
        tx.commit()?;
        Ok(receivers)
    })
    .await
}
