//! Ledger error types.

use escrowsettle_common::{BookingId, Currency, EscrowError, ProviderId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by ledger primitives.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Credit currency differs from the wallet currency.
    #[error("Wallet of {provider_id} holds {wallet}, cannot credit {credit}")]
    CurrencyMismatch {
        provider_id: ProviderId,
        wallet: Currency,
        credit: Currency,
    },

    /// Wallet credits may not be negative.
    #[error("Credit amount must not be negative, got {0}")]
    NegativeCredit(Decimal),

    /// A completed escrow release already exists for the booking.
    #[error("Completed escrow release already recorded for booking {0}")]
    DuplicateRelease(BookingId),
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

impl From<LedgerError> for EscrowError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::CurrencyMismatch { wallet, credit, .. } => EscrowError::CurrencyMismatch {
                wallet,
                booking: credit,
            },
            LedgerError::NegativeCredit(amount) => EscrowError::InvalidRequest {
                message: format!("credit amount must not be negative, got {amount}"),
                field: Some("amount".to_string()),
            },
            LedgerError::DuplicateRelease(booking_id) => EscrowError::Persistence(format!(
                "unique violation: completed escrow release exists for booking {booking_id}"
            )),
        }
    }
}
