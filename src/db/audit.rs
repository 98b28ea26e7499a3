use chrono::{DateTime, Utc};
use rusqlite::params;

use super::models::AuditLog;
use super::{new_id, with_conn, DbPool};

pub async fn log_audit(
    pool: &DbPool,
    user_id: &str,
    action: &str,
    table_name: &str,
    record_id: Option<&str>,
    details: Option<String>,
) -> anyhow::Result<()> {
    let user_id = user_id.to_string();
    let action = action.to_string();
    let table_name = table_name.to_string();
    let record_id = record_id.map(str::to_string);
    with_conn(pool, move |conn| {
        conn.execute(
            "INSERT INTO audit_logs (id, user_id, action, table_name, record_id, details, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![new_id(), user_id, action, table_name, record_id, details, Utc::now()],
        )?;
        Ok(())
    })
    .await
}

/// Audit writes never fail the request that triggered them.
pub async fn record_audit(
    pool: &DbPool,
    user_id: &str,
    action: &str,
    table_name: &str,
    record_id: &str,
    details: Option<String>,
) {
    if let Err(e) = log_audit(pool, user_id, action, table_name, Some(record_id), details).await {
        tracing::warn!("Audit write failed for {} {}: {}", action, record_id, e);
    }
}

/// Oldest first, optionally only entries at or after `since`.
pub async fn list_audit_logs(pool: &DbPool, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<AuditLog>> {
    with_conn(pool, move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, user_id, action, table_name, record_id, details, created_at FROM audit_logs \
             WHERE ?1 IS NULL OR created_at >= ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let list = stmt
            .query_map([since], |row| {
                Ok(AuditLog {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    action: row.get(2)?,
                    table_name: row.get(3)?,
                    record_id: row.get(4)?,
                    details: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(list)
    })
    .await
}
