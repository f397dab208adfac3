//! Append-only ledger entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use escrowsettle_common::{
    Booking, BookingId, Currency, EscrowError, ReleaseReason, SettlementBreakdown,
    TransactionId, UserType,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Kind of money movement recorded by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// Escrow paid out to the provider.
    EscrowRelease,
    /// Money returned to the client.
    Refund,
    /// Client payment captured into escrow.
    BookingPayment,
    /// Platform commission.
    Commission,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::EscrowRelease => "ESCROW_RELEASE",
            TransactionType::Refund => "REFUND",
            TransactionType::BookingPayment => "BOOKING_PAYMENT",
            TransactionType::Commission => "COMMISSION",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ESCROW_RELEASE" => Ok(TransactionType::EscrowRelease),
            "REFUND" => Ok(TransactionType::Refund),
            "BOOKING_PAYMENT" => Ok(TransactionType::BookingPayment),
            "COMMISSION" => Ok(TransactionType::Commission),
            other => Err(EscrowError::InvalidRequest {
                message: format!("unknown transaction type {other}"),
                field: Some("type".to_string()),
            }),
        }
    }
}

/// Processing status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "COMPLETED" => Ok(TransactionStatus::Completed),
            "FAILED" => Ok(TransactionStatus::Failed),
            other => Err(EscrowError::InvalidRequest {
                message: format!("unknown transaction status {other}"),
                field: Some("status".to_string()),
            }),
        }
    }
}

/// Audit data recorded with an escrow release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMetadata {
    pub reason: ReleaseReason,
    pub original_total: Decimal,
    pub commission_amount: Decimal,
    pub commission_defaulted: bool,
    pub provider_amount: Decimal,
    pub client_confirm_deadline: Option<DateTime<Utc>>,
    pub released_at: DateTime<Utc>,
}

/// Typed metadata, one shape per transaction type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionMetadata {
    EscrowRelease(ReleaseMetadata),
    Refund { reason: Option<String> },
    BookingPayment { payment_reference: Option<String> },
    Commission { rate: Decimal },
}

/// A single append-only ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub booking_id: BookingId,
    /// Party the row is booked against.
    pub user_id: String,
    pub user_type: UserType,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: TransactionStatus,
    pub metadata: TransactionMetadata,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Build the completed escrow-release row for a booking.
    pub fn escrow_release(
        booking: &Booking,
        breakdown: &SettlementBreakdown,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            booking_id: booking.id,
            user_id: booking.provider_id.to_string(),
            user_type: UserType::Provider,
            transaction_type: TransactionType::EscrowRelease,
            amount: breakdown.provider_amount,
            currency: booking.currency.clone(),
            status: TransactionStatus::Completed,
            metadata: TransactionMetadata::EscrowRelease(ReleaseMetadata {
                reason,
                original_total: breakdown.total_amount,
                commission_amount: breakdown.commission_amount,
                commission_defaulted: breakdown.commission_defaulted,
                provider_amount: breakdown.provider_amount,
                client_confirm_deadline: booking.client_confirm_deadline,
                released_at: now,
            }),
            created_at: now,
        }
    }

    /// Whether this row is a completed escrow release.
    pub fn is_completed_release(&self) -> bool {
        self.transaction_type == TransactionType::EscrowRelease
            && self.status == TransactionStatus::Completed
    }

    /// Release reason, when this row is an escrow release.
    pub fn release_reason(&self) -> Option<ReleaseReason> {
        match &self.metadata {
            TransactionMetadata::EscrowRelease(meta) => Some(meta.reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use escrowsettle_common::{ClientId, CommissionRate, Money, ProviderId};
    use rust_decimal_macros::dec;

    #[test]
    fn test_escrow_release_row() {
        let booking = Booking::new(
            ClientId::new("client_1"),
            ProviderId::new("provider_1"),
            Money::new(dec!(100), Currency::usd()),
            Utc::now(),
        );
        let breakdown = booking.settlement_breakdown(CommissionRate::DEFAULT);
        let now = Utc::now();

        let tx = Transaction::escrow_release(
            &booking,
            &breakdown,
            ReleaseReason::AutoReleaseNoClientResponse,
            now,
        );

        assert!(tx.is_completed_release());
        assert_eq!(tx.amount, dec!(95));
        assert_eq!(tx.user_id, "provider_1");
        assert_eq!(tx.user_type, UserType::Provider);
        assert_eq!(
            tx.release_reason(),
            Some(ReleaseReason::AutoReleaseNoClientResponse)
        );
    }

    #[test]
    fn test_metadata_is_tagged() {
        let meta = TransactionMetadata::Refund {
            reason: Some("cancelled".into()),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["kind"], "REFUND");

        let back: TransactionMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_type_and_status_parse() {
        assert_eq!(
            "ESCROW_RELEASE".parse::<TransactionType>().unwrap(),
            TransactionType::EscrowRelease
        );
        assert_eq!(
            "COMPLETED".parse::<TransactionStatus>().unwrap(),
            TransactionStatus::Completed
        );
        assert!("PAYOUT".parse::<TransactionType>().is_err());
    }
}
