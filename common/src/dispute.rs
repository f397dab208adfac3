//! Dispute records attached to bookings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BookingId, DisputeId, EscrowError, UserType};

/// Internal review status of a dispute. Settlement gating ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeStatus {
    Open,
    UnderReview,
    Resolved,
    Closed,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::Open => "OPEN",
            DisputeStatus::UnderReview => "UNDER_REVIEW",
            DisputeStatus::Resolved => "RESOLVED",
            DisputeStatus::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisputeStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(DisputeStatus::Open),
            "UNDER_REVIEW" => Ok(DisputeStatus::UnderReview),
            "RESOLVED" => Ok(DisputeStatus::Resolved),
            "CLOSED" => Ok(DisputeStatus::Closed),
            other => Err(EscrowError::InvalidRequest {
                message: format!("unknown dispute status {other}"),
                field: Some("status".to_string()),
            }),
        }
    }
}

/// A dispute raised against a booking. At most one per booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub booking_id: BookingId,
    /// User who raised the dispute.
    pub raised_by: String,
    pub raised_by_type: UserType,
    pub reason: String,
    pub status: DisputeStatus,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Dispute {
    /// Open a new dispute.
    pub fn open(
        booking_id: BookingId,
        raised_by: impl Into<String>,
        raised_by_type: UserType,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DisputeId::new(),
            booking_id,
            raised_by: raised_by.into(),
            raised_by_type,
            reason: reason.into(),
            status: DisputeStatus::Open,
            resolution: None,
            created_at: now,
            resolved_at: None,
        }
    }

    /// Whether the dispute's review has concluded.
    pub fn is_resolved(&self) -> bool {
        matches!(self.status, DisputeStatus::Resolved | DisputeStatus::Closed)
    }
}
