use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::{Notification, NotificationKind};
use super::{new_id, with_conn, DbPool};

/// Upper bound on a single notification listing.
pub const NOTIFICATION_PAGE: i64 = 50;

const NOTIFICATION_COLUMNS: &str = "id, user_id, kind, message, read, related_donation, related_user, created_at";

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row.get(2)?,
        message: row.get(3)?,
        read: row.get(4)?,
        related_donation: row.get(5)?,
        related_user: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub related_donation: Option<String>,
    pub related_user: Option<String>,
}

pub(crate) fn insert_notification(
    conn: &Connection,
    notification: &NewNotification,
    now: DateTime<Utc>,
) -> rusqlite::Result<String> {
    let id = new_id();
    conn.execute(
        "INSERT INTO notifications (id, user_id, kind, message, read, related_donation, related_user, created_at) \
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)",
        params![
            id,
            notification.user_id,
            notification.kind,
            notification.message,
            notification.related_donation,
            notification.related_user,
            now,
        ],
    )?;
    Ok(id)
}

pub async fn create_notification(
    pool: &DbPool,
    notification: NewNotification,
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    with_conn(pool, move |conn| Ok(insert_notification(conn, &notification, now)?)).await
}

/// Newest first, capped at [`NOTIFICATION_PAGE`].
pub async fn list_notifications(
    pool: &DbPool,
    user_id: &str,
    read: Option<bool>,
) -> anyhow::Result<Vec<Notification>> {
    let user_id = user_id.to_string();
    with_conn(pool, move |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE user_id = ?1 AND (?2 IS NULL OR read = ?2) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?3"
        ))?;
        let list = stmt
            .query_map(params![user_id, read, NOTIFICATION_PAGE], notification_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(list)
    })
    .await
}

pub async fn count_unread(pool: &DbPool, user_id: &str) -> anyhow::Result<i64> {
    let user_id = user_id.to_string();
    with_conn(pool, move |conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND read = 0",
            [&user_id],
            |row| row.get(0),
        )?)
    })
    .await
}

pub async fn get_notification(pool: &DbPool, id: &str) -> anyhow::Result<Option<Notification>> {
    let id = id.to_string();
    with_conn(pool, move |conn| {
        Ok(conn
            .query_row(
                &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
                [&id],
                notification_from_row,
            )
            .optional()?)
    })
    .await
}

pub async fn mark_notification_read(pool: &DbPool, id: &str) -> anyhow::Result<bool> {
    let id = id.to_string();
    with_conn(pool, move |conn| {
        Ok(conn.execute("UPDATE notifications SET read = 1 WHERE id = ?1", [&id])? > 0)
    })
    .await
}

/// Returns how many notifications flipped to read.
pub async fn mark_all_read(pool: &DbPool, user_id: &str) -> anyhow::Result<usize> {
    let user_id = user_id.to_string();
    with_conn(pool, move |conn| {
        Ok(conn.execute("UPDATE notifications SET read = 1 WHERE user_id = ?1 AND read = 0", [&user_id])?)
    })
    .await
}

pub async fn delete_notification(pool: &DbPool, id: &str) -> anyhow::Result<bool> {
    let id = id.to_string();
    with_conn(pool, move |conn| Ok(conn.execute("DELETE FROM notifications WHERE id = ?1", [&id])? > 0)).await
}
