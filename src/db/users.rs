use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value, OptionalExtension, Row};
use serde::Serialize;

use super::models::{DonationStatus, Role, User, UserSummary};
use super::{new_id, with_conn, DbPool};

const USER_COLUMNS: &str = "id, email, password_hash, full_name, role, verified, impact_score, \
    organization_name, phone, address, created_at, updated_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        full_name: row.get(3)?,
        role: row.get(4)?,
        verified: row.get(5)?,
        impact_score: row.get(6)?,
        organization_name: row.get(7)?,
        phone: row.get(8)?,
        address: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub full_name: String,
    pub role: Role,
    pub organization_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Default)]
pub struct ProfileUpdate {
    pub full_name: Option<String>,
    pub organization_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

/// Returns `None` when the email is already registered.
pub async fn create_user(pool: &DbPool, new_user: NewUser, now: DateTime<Utc>) -> anyhow::Result<Option<User>> {
    with_conn(pool, move |conn| {
        let email = new_user.email.trim().to_lowercase();
        let id = new_id();
        let inserted = conn.execute(
            "INSERT INTO users (id, email, password_hash, full_name, role, verified, impact_score, \
             organization_name, phone, address, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?7, ?8, ?9, ?9) \
             ON CONFLICT(email) DO NOTHING",
            params![
                id,
                email,
                new_user.password_hash,
                new_user.full_name.trim(),
                new_user.role,
                new_user.organization_name,
                new_user.phone,
                new_user.address,
                now,
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        let user = conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            [&id],
            user_from_row,
        )?;
        Ok(Some(user))
    })
    .await
}

pub async fn get_user(pool: &DbPool, id: &str) -> anyhow::Result<Option<User>> {
    let id = id.to_string();
    with_conn(pool, move |conn| {
        Ok(conn
            .query_row(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"), [&id], user_from_row)
            .optional()?)
    })
    .await
}

pub async fn find_user_by_email(pool: &DbPool, email: &str) -> anyhow::Result<Option<User>> {
    let email = email.trim().to_lowercase();
    with_conn(pool, move |conn| {
        Ok(conn
            .query_row(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"), [&email], user_from_row)
            .optional()?)
    })
    .await
}

pub async fn list_users(pool: &DbPool, role: Option<Role>, verified: Option<bool>) -> anyhow::Result<Vec<User>> {
    with_conn(pool, move |conn| {
        let mut sql = format!("SELECT {USER_COLUMNS} FROM users WHERE 1 = 1");
        let mut args: Vec<Value> = Vec::new();
        if let Some(role) = role {
            args.push(Value::Text(role.as_str().to_string()));
            sql.push_str(&format!(" AND role = ?{}", args.len()));
        }
        if let Some(verified) = verified {
            args.push(Value::Integer(verified as i64));
            sql.push_str(&format!(" AND verified = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");

        let mut stmt = conn.prepare(&sql)?;
        let users = stmt
            .query_map(params_from_iter(args), user_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    })
    .await
}

pub async fn verify_user(pool: &DbPool, id: &str, now: DateTime<Utc>) -> anyhow::Result<Option<User>> {
    let id = id.to_string();
    with_conn(pool, move |conn| {
        let updated = conn.execute(
            "UPDATE users SET verified = 1, updated_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        Ok(Some(conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            [&id],
            user_from_row,
        )?))
    })
    .await
}

pub async fn update_profile(
    pool: &DbPool,
    id: &str,
    update: ProfileUpdate,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<User>> {
    let id = id.to_string();
    with_conn(pool, move |conn| {
        let updated = conn.execute(
            "UPDATE users SET \
                full_name = COALESCE(?2, full_name), \
                organization_name = COALESCE(?3, organization_name), \
                phone = COALESCE(?4, phone), \
                address = COALESCE(?5, address), \
                updated_at = ?6 \
             WHERE id = ?1",
            params![
                id,
                update.full_name.as_deref().map(str::trim),
                update.organization_name,
                update.phone,
                update.address,
                now,
            ],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        Ok(Some(conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            [&id],
            user_from_row,
        )?))
    })
    .await
}

pub async fn set_user_role(pool: &DbPool, email: &str, role: Role, now: DateTime<Utc>) -> anyhow::Result<bool> {
    let email = email.trim().to_lowercase();
    with_conn(pool, move |conn| {
        let updated = conn.execute(
            "UPDATE users SET role = ?2, verified = 1, updated_at = ?3 WHERE email = ?1",
            params![email, role, now],
        )?;
        Ok(updated > 0)
    })
    .await
}

/// Looks up the embeddable summaries for a set of user ids; unknown ids are skipped.
pub async fn user_summaries(pool: &DbPool, ids: Vec<String>) -> anyhow::Result<HashMap<String, UserSummary>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    with_conn(pool, move |conn| {
        let placeholders = (1..=ids.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT id, full_name, email, organization_name, phone FROM users WHERE id IN ({placeholders})"
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            Ok(UserSummary {
                id: row.get(0)?,
                full_name: row.get(1)?,
                email: row.get(2)?,
                organization_name: row.get(3)?,
                phone: row.get(4)?,
            })
        })?;
        let mut out = HashMap::new();
        for summary in rows {
            let summary = summary?;
            out.insert(summary.id.clone(), summary);
        }
        Ok(out)
    })
    .await
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DonorStats {
    pub total_donations: i64,
    pub active_donations: i64,
    pub completed_donations: i64,
    pub total_items: i64,
    pub impact_score: i64,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStats {
    pub claimed_donations: i64,
    pub completed_received: i64,
    pub total_items: i64,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    pub total_users: i64,
    pub total_donors: i64,
    pub total_receivers: i64,
    pub total_donations: i64,
    pub active_donations: i64,
    pub completed_donations: i64,
}

pub async fn donor_stats(pool: &DbPool, donor_id: &str) -> anyhow::Result<DonorStats> {
    let donor_id = donor_id.to_string();
    with_conn(pool, move |conn| {
        let [a, b, c] = DonationStatus::ACTIVE;
        let (total, active, completed, items): (i64, i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), \
                COALESCE(SUM(status IN (?2, ?3, ?4)), 0), \
                COALESCE(SUM(status = ?5), 0), \
                COALESCE(SUM(CASE WHEN status = ?5 THEN quantity ELSE 0 END), 0) \
             FROM donations WHERE donor_id = ?1",
            params![donor_id, a, b, c, DonationStatus::Completed],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        let impact_score: i64 = conn
            .query_row("SELECT impact_score FROM users WHERE id = ?1", [&donor_id], |row| row.get(0))
            .optional()?
            .unwrap_or(0);
        Ok(DonorStats {
            total_donations: total,
            active_donations: active,
            completed_donations: completed,
            total_items: items,
            impact_score,
        })
    })
    .await
}

pub async fn receiver_stats(pool: &DbPool, receiver_id: &str) -> anyhow::Result<ReceiverStats> {
    let receiver_id = receiver_id.to_string();
    with_conn(pool, move |conn| {
        let stats = conn.query_row(
            "SELECT COUNT(*), \
                COALESCE(SUM(status = ?2), 0), \
                COALESCE(SUM(CASE WHEN status = ?2 THEN quantity ELSE 0 END), 0) \
             FROM donations WHERE claimed_by = ?1",
            params![receiver_id, DonationStatus::Completed],
            |row| {
                Ok(ReceiverStats {
                    claimed_donations: row.get(0)?,
                    completed_received: row.get(1)?,
                    total_items: row.get(2)?,
                })
            },
        )?;
        Ok(stats)
    })
    .await
}

pub async fn admin_stats(pool: &DbPool) -> anyhow::Result<AdminStats> {
    with_conn(pool, move |conn| {
        let (total_users, total_donors, total_receivers): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(role = ?1), 0), COALESCE(SUM(role = ?2), 0) FROM users",
            params![Role::Donor, Role::Receiver],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let [a, b, c] = DonationStatus::ACTIVE;
        let (total_donations, active_donations, completed_donations): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status IN (?1, ?2, ?3)), 0), COALESCE(SUM(status = ?4), 0) \
             FROM donations",
            params![a, b, c, DonationStatus::Completed],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(AdminStats {
            total_users,
            total_donors,
            total_receivers,
            total_donations,
            active_donations,
            completed_donations,
        })
    })
    .await
}
