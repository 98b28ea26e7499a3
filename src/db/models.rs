use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::geo::Coordinates;

/// Stores a fieldless enum as its wire string, so the column, the JSON body
/// and the query string all agree on one spelling.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow::anyhow!("unknown {} value: {}", stringify!($name), other)),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
            }
        }
    };
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Donor,
    Receiver,
    Admin,
}

text_enum!(Role {
    Donor => "donor",
    Receiver => "receiver",
    Admin => "admin",
});

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DonationKind {
    Food,
    Books,
    Clothes,
}

text_enum!(DonationKind {
    Food => "food",
    Books => "books",
    Clothes => "clothes",
});

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DonationStatus {
    Available,
    Claimed,
    InTransit,
    Completed,
    Cancelled,
}

text_enum!(DonationStatus {
    Available => "available",
    Claimed => "claimed",
    InTransit => "in-transit",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl DonationStatus {
    /// Statuses counted as "active" in dashboards.
    pub const ACTIVE: [DonationStatus; 3] = [
        DonationStatus::Available,
        DonationStatus::Claimed,
        DonationStatus::InTransit,
    ];

    /// Forward-only lifecycle: available -> claimed -> in-transit -> completed,
    /// with cancellation allowed until the goods are on the move.
    pub fn can_transition_to(self, next: DonationStatus) -> bool {
        use DonationStatus::*;
        matches!(
            (self, next),
            (Available, Claimed)
                | (Available, Cancelled)
                | (Claimed, InTransit)
                | (Claimed, Completed)
                | (Claimed, Cancelled)
                | (InTransit, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DonationStatus::Completed | DonationStatus::Cancelled)
    }

    /// Every status that may move to `next`.
    pub fn sources_of(next: DonationStatus) -> Vec<DonationStatus> {
        use DonationStatus::*;
        [Available, Claimed, InTransit, Completed, Cancelled]
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DonationPosted,
    RequestReceived,
    RequestAccepted,
    RequestRejected,
    DonationCompleted,
    DonationClaimed,
    DonationCancelled,
}

text_enum!(NotificationKind {
    DonationPosted => "donation_posted",
    RequestReceived => "request_received",
    RequestAccepted => "request_accepted",
    RequestRejected => "request_rejected",
    DonationCompleted => "donation_completed",
    DonationClaimed => "donation_claimed",
    DonationCancelled => "donation_cancelled",
});

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

text_enum!(RequestStatus {
    Pending => "pending",
    Accepted => "accepted",
    Rejected => "rejected",
});

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub full_name: String,
    pub role: Role,
    pub verified: bool,
    pub impact_score: i64,
    pub organization_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The slice of a user embedded in donation listings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub full_name: String,
    pub email: String,
    pub organization_name: Option<String>,
    pub phone: Option<String>,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            full_name: user.full_name.clone(),
            email: user.email.clone(),
            organization_name: user.organization_name.clone(),
            phone: user.phone.clone(),
        }
    }
}

/// What other users may see of an account: no contact details.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub id: String,
    pub full_name: String,
    pub role: Role,
    pub verified: bool,
    pub organization_name: Option<String>,
    pub impact_score: i64,
    pub created_at: DateTime<Utc>,
}

impl From<User> for PublicProfile {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            full_name: user.full_name,
            role: user.role,
            verified: user.verified,
            organization_name: user.organization_name,
            impact_score: user.impact_score,
            created_at: user.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Location {
    pub address: String,
    pub coordinates: Coordinates,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Donation {
    pub id: String,
    pub donor_id: String,
    #[serde(rename = "type")]
    pub kind: DonationKind,
    pub item_name: String,
    pub quantity: i64,
    pub description: Option<String>,
    pub images: Vec<String>,
    pub location: Location,
    pub expiry_time: Option<DateTime<Utc>>,
    pub status: DonationStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Donation {
    /// Only food spoils; other kinds never expire even if an expiry was stored.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.kind == DonationKind::Food && self.expiry_time.is_some_and(|t| t < now)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    pub read: bool,
    pub related_donation: Option<String>,
    pub related_user: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DonationRequest {
    pub id: String,
    pub receiver_id: String,
    pub donation_id: String,
    pub message: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    pub id: String,
    pub user_id: String,
    pub action: String,
    pub table_name: String,
    pub record_id: Option<String>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}
