use chrono::{DateTime, Utc};
use rusqlite::types::{ToSql, Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::models::{Donation, DonationKind, DonationStatus, Location};
use super::{new_id, with_conn, DbPool};
use crate::geo::Coordinates;

const DONATION_COLUMNS: &str = "id, donor_id, kind, item_name, quantity, description, images, \
    address, lat, lng, expiry_time, status, claimed_by, claimed_at, completed_at, created_at, updated_at";

fn donation_from_row(row: &Row<'_>) -> rusqlite::Result<Donation> {
    let images_json: String = row.get(6)?;
    let images: Vec<String> = serde_json::from_str(&images_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(Donation {
        id: row.get(0)?,
        donor_id: row.get(1)?,
        kind: row.get(2)?,
        item_name: row.get(3)?,
        quantity: row.get(4)?,
        description: row.get(5)?,
        images,
        location: Location {
            address: row.get(7)?,
            coordinates: Coordinates::new(row.get(8)?, row.get(9)?),
        },
        expiry_time: row.get(10)?,
        status: row.get(11)?,
        claimed_by: row.get(12)?,
        claimed_at: row.get(13)?,
        completed_at: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

pub(crate) fn fetch_donation(conn: &Connection, id: &str) -> rusqlite::Result<Option<Donation>> {
    conn.query_row(
        &format!("SELECT {DONATION_COLUMNS} FROM donations WHERE id = ?1"),
        [id],
        donation_from_row,
    )
    .optional()
}

fn query_donations(conn: &Connection, where_clause: &str, args: Vec<Value>) -> anyhow::Result<Vec<Donation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DONATION_COLUMNS} FROM donations {where_clause} ORDER BY created_at DESC, rowid DESC"
    ))?;
    let donations = stmt
        .query_map(params_from_iter(args), donation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(donations)
}

/// Largest quantity a single donation may carry.
pub const MAX_QUANTITY: i64 = 1_000_000;

fn check_quantity(quantity: i64) -> anyhow::Result<()> {
    anyhow::ensure!(
        (1..=MAX_QUANTITY).contains(&quantity),
        "quantity {} outside 1..={}",
        quantity,
        MAX_QUANTITY
    );
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NewDonation {
    pub kind: DonationKind,
    pub item_name: String,
    pub quantity: i64,
    pub description: Option<String>,
    pub images: Vec<String>,
    pub location: Location,
    pub expiry_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct DonationUpdate {
    pub item_name: Option<String>,
    pub quantity: Option<i64>,
    pub description: Option<String>,
    pub images: Option<Vec<String>>,
    pub location: Option<Location>,
    pub expiry_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DonationFilter {
    pub kind: Option<DonationKind>,
    pub status: Option<DonationStatus>,
}

pub async fn create_donation(
    pool: &DbPool,
    donor_id: &str,
    new_donation: NewDonation,
    now: DateTime<Utc>,
) -> anyhow::Result<Donation> {
    check_quantity(new_donation.quantity)?;
    let donor_id = donor_id.to_string();
    with_conn(pool, move |conn| {
        let id = new_id();
        let images = serde_json::to_string(&new_donation.images)?;
        conn.execute(
            "INSERT INTO donations (id, donor_id, kind, item_name, quantity, description, images, \
             address, lat, lng, expiry_time, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                id,
                donor_id,
                new_donation.kind,
                new_donation.item_name.trim(),
                new_donation.quantity,
                new_donation.description,
                images,
                new_donation.location.address,
                new_donation.location.coordinates.lat,
                new_donation.location.coordinates.lng,
                new_donation.expiry_time,
                DonationStatus::Available,
                now,
            ],
        )?;
        fetch_donation(conn, &id)?.ok_or_else(|| anyhow::anyhow!("donation {} vanished after insert", id))
    })
    .await
}

pub async fn get_donation(pool: &DbPool, id: &str) -> anyhow::Result<Option<Donation>> {
    let id = id.to_string();
    with_conn(pool, move |conn| Ok(fetch_donation(conn, &id)?)).await
}

/// Newest first. A missing status filter lists every status.
pub async fn list_donations(pool: &DbPool, filter: DonationFilter) -> anyhow::Result<Vec<Donation>> {
    with_conn(pool, move |conn| {
        let mut clauses = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        if let Some(kind) = filter.kind {
            args.push(Value::Text(kind.as_str().to_string()));
            clauses.push(format!("kind = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", args.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        query_donations(conn, &where_clause, args)
    })
    .await
}

pub async fn list_donations_by_donor(pool: &DbPool, donor_id: &str) -> anyhow::Result<Vec<Donation>> {
    let donor_id = donor_id.to_string();
    with_conn(pool, move |conn| query_donations(conn, "WHERE donor_id = ?1", vec![Value::Text(donor_id)])).await
}

pub async fn list_donations_claimed_by(pool: &DbPool, receiver_id: &str) -> anyhow::Result<Vec<Donation>> {
    let receiver_id = receiver_id.to_string();
    with_conn(pool, move |conn| query_donations(conn, "WHERE claimed_by = ?1", vec![Value::Text(receiver_id)]))
        .await
}

/// Applies the present fields of `update`. Only the donor can edit, and only
/// while the donation is still available; otherwise `None`.
pub async fn update_donation(
    pool: &DbPool,
    donor_id: &str,
    id: &str,
    update: DonationUpdate,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<Donation>> {
    if let Some(quantity) = update.quantity {
        check_quantity(quantity)?;
    }
    let donor_id = donor_id.to_string();
    let id = id.to_string();
    with_conn(pool, move |conn| {
        let images = update.images.as_ref().map(serde_json::to_string).transpose()?;
        let (address, lat, lng) = match &update.location {
            Some(loc) => (Some(loc.address.clone()), Some(loc.coordinates.lat), Some(loc.coordinates.lng)),
            None => (None, None, None),
        };
        let updated = conn.execute(
            "UPDATE donations SET \
                item_name = COALESCE(?3, item_name), \
                quantity = COALESCE(?4, quantity), \
                description = COALESCE(?5, description), \
                images = COALESCE(?6, images), \
                address = COALESCE(?7, address), \
                lat = COALESCE(?8, lat), \
                lng = COALESCE(?9, lng), \
                expiry_time = COALESCE(?10, expiry_time), \
                updated_at = ?11 \
             WHERE id = ?1 AND donor_id = ?2 AND status = ?12",
            params![
                id,
                donor_id,
                update.item_name.as_deref().map(str::trim),
                update.quantity,
                update.description,
                images,
                address,
                lat,
                lng,
                update.expiry_time,
                now,
                DonationStatus::Available,
            ],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        Ok(fetch_donation(conn, &id)?)
    })
    .await
}

/// Deletes unless the goods are already moving or delivered.
pub async fn delete_donation(pool: &DbPool, donor_id: &str, id: &str) -> anyhow::Result<bool> {
    let donor_id = donor_id.to_string();
    let id = id.to_string();
    with_conn(pool, move |conn| {
        let deleted = conn.execute(
            "DELETE FROM donations WHERE id = ?1 AND donor_id = ?2 AND status NOT IN (?3, ?4)",
            params![id, donor_id, DonationStatus::InTransit, DonationStatus::Completed],
        )?;
        Ok(deleted > 0)
    })
    .await
}

/// The check and the write are one statement, so concurrent claims cannot both win.
pub(crate) fn claim_in(conn: &Connection, id: &str, receiver_id: &str, now: DateTime<Utc>) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE donations SET status = ?3, claimed_by = ?2, claimed_at = ?4, updated_at = ?4 \
         WHERE id = ?1 AND status = ?5",
        params![id, receiver_id, DonationStatus::Claimed, now, DonationStatus::Available],
    )?;
    Ok(updated > 0)
}

pub async fn claim_donation(pool: &DbPool, id: &str, receiver_id: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
    let id = id.to_string();
    let receiver_id = receiver_id.to_string();
    with_conn(pool, move |conn| Ok(claim_in(conn, &id, &receiver_id, now)?)).await
}

/// Moves a donation to `next` if its current status allows it. Completion has
/// side effects and goes through [`complete_donation`] instead.
pub async fn transition_donation(
    pool: &DbPool,
    id: &str,
    next: DonationStatus,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    anyhow::ensure!(next != DonationStatus::Completed, "use complete_donation for completion");
    anyhow::ensure!(next != DonationStatus::Claimed, "use claim_donation for claims");

    let id = id.to_string();
    with_conn(pool, move |conn| {
        let sources = DonationStatus::sources_of(next);
        if sources.is_empty() {
            return Ok(false);
        }
        let placeholders = (0..sources.len()).map(|i| format!("?{}", i + 4)).collect::<Vec<_>>().join(", ");
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(id), Box::new(next), Box::new(now)];
        args.extend(sources.into_iter().map(|s| Box::new(s) as Box<dyn ToSql>));
        let updated = conn.execute(
            &format!("UPDATE donations SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status IN ({placeholders})"),
            params_from_iter(args.iter()),
        )?;
        Ok(updated > 0)
    })
    .await
}

/// Marks a claimed or in-transit donation completed and credits the donor's
/// impact score with its quantity, atomically.
pub async fn complete_donation(pool: &DbPool, id: &str, now: DateTime<Utc>) -> anyhow::Result<Option<Donation>> {
    let id = id.to_string();
    with_conn(pool, move |conn| {
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE donations SET status = ?2, completed_at = ?3, updated_at = ?3 \
             WHERE id = ?1 AND status IN (?4, ?5)",
            params![
                id,
                DonationStatus::Completed,
                now,
                DonationStatus::Claimed,
                DonationStatus::InTransit,
            ],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        let (donor_id, quantity): (String, i64) = tx.query_row(
            "SELECT donor_id, quantity FROM donations WHERE id = ?1",
            [&id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let score: i64 = tx.query_row("SELECT impact_score FROM users WHERE id = ?1", [&donor_id], |row| row.get(0))?;
        // SQLite would spill an overflowing sum into REAL.
        tx.execute(
            "UPDATE users SET impact_score = ?2, updated_at = ?3 WHERE id = ?1",
            params![donor_id, score.saturating_add(quantity), now],
        )?;
        let donation = fetch_donation(&tx, &id)?;
        tx.commit()?;
        Ok(donation)
    })
    .await
}
