//! Error types for EscrowSettle.

use crate::{BookingId, BookingStatus, Currency};
use std::fmt;
use thiserror::Error;

/// Main error type for escrow operations.
#[derive(Error, Debug)]
pub enum EscrowError {
    /// The booking is not in a state that allows the requested operation.
    #[error("Precondition failed for booking {booking_id}: {reason}")]
    PreconditionFailed {
        booking_id: BookingId,
        reason: PreconditionReason,
    },

    /// Booking not found.
    #[error("Booking not found: {0}")]
    BookingNotFound(BookingId),

    /// The actor is not a party allowed to perform the operation.
    #[error("Actor {actor} may not act on booking {booking_id}")]
    Unauthorized { booking_id: BookingId, actor: String },

    /// Malformed request.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
        field: Option<String>,
    },

    /// Invalid state transition.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },

    /// Credit currency does not match the wallet currency.
    #[error("Currency mismatch: wallet holds {wallet}, booking is in {booking}")]
    CurrencyMismatch { wallet: Currency, booking: Currency },

    /// The atomic store transaction failed; nothing was written.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Post-commit event delivery failed.
    #[error("Notifier failure: {0}")]
    Notifier(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl EscrowError {
    /// Shorthand for a precondition failure.
    pub fn precondition(booking_id: BookingId, reason: PreconditionReason) -> Self {
        EscrowError::PreconditionFailed { booking_id, reason }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EscrowError::Persistence(_) | EscrowError::Notifier(_)
        )
    }

    /// Stable error code for API responses and batch summaries.
    pub fn error_code(&self) -> &'static str {
        match self {
            EscrowError::PreconditionFailed { .. } => "PRECONDITION_FAILED",
            EscrowError::BookingNotFound(_) => "BOOKING_NOT_FOUND",
            EscrowError::Unauthorized { .. } => "UNAUTHORIZED",
            EscrowError::InvalidRequest { .. } => "INVALID_REQUEST",
            EscrowError::InvalidTransition { .. } => "INVALID_TRANSITION",
            EscrowError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            EscrowError::Persistence(_) => "PERSISTENCE_FAILURE",
            EscrowError::Notifier(_) => "NOTIFIER_FAILURE",
            EscrowError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Why a booking failed a settlement or dispute guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionReason {
    /// Status is not the one the operation requires.
    WrongStatus {
        expected: BookingStatus,
        actual: BookingStatus,
    },
    /// The client payment has not been captured.
    NotPaid,
    /// A dispute exists for the booking.
    OpenDispute,
    /// Escrow for this booking has already been released.
    AlreadySettled,
}

impl fmt::Display for PreconditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreconditionReason::WrongStatus { expected, actual } => {
                write!(f, "status is {actual}, expected {expected}")
            }
            PreconditionReason::NotPaid => f.write_str("booking is not paid"),
            PreconditionReason::OpenDispute => f.write_str("booking has a dispute"),
            PreconditionReason::AlreadySettled => f.write_str("escrow already released"),
        }
    }
}

/// Result type alias for escrow operations.
pub type Result<T> = std::result::Result<T, EscrowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_retry() {
        let id = BookingId::new();
        let err = EscrowError::precondition(id, PreconditionReason::OpenDispute);
        assert_eq!(err.error_code(), "PRECONDITION_FAILED");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("dispute"));

        let err = EscrowError::Persistence("connection reset".into());
        assert_eq!(err.error_code(), "PERSISTENCE_FAILURE");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_wrong_status_message() {
        let reason = PreconditionReason::WrongStatus {
            expected: BookingStatus::AwaitingClientConfirmation,
            actual: BookingStatus::Cancelled,
        };
        assert_eq!(
            reason.to_string(),
            "status is CANCELLED, expected AWAITING_CLIENT_CONFIRMATION"
        );
    }
}
