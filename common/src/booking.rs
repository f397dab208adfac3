//! Booking types and state machine for EscrowSettle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    BookingId, ClientId, CommissionRate, Currency, EscrowError, Money, PreconditionReason,
    ProviderId, UserType,
};

/// Booking status representing the engagement lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    /// Requested by the client, not yet accepted by the provider.
    Pending,
    /// Accepted by the provider.
    Confirmed,
    /// Work has started.
    InProgress,
    /// Provider marked the work done; the client has a window to respond.
    AwaitingClientConfirmation,
    /// Escrow released to the provider.
    Completed,
    /// Client disputed the work; settlement is blocked.
    Disputed,
    /// Cancelled before completion.
    Cancelled,
    /// Cancelled and refunded to the client.
    Refunded,
}

impl BookingStatus {
    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[BookingStatus] {
        match self {
            BookingStatus::Pending => &[BookingStatus::Confirmed, BookingStatus::Cancelled],
            BookingStatus::Confirmed => &[BookingStatus::InProgress, BookingStatus::Cancelled],
            BookingStatus::InProgress => &[
                BookingStatus::AwaitingClientConfirmation,
                BookingStatus::Cancelled,
            ],
            BookingStatus::AwaitingClientConfirmation => {
                &[BookingStatus::Completed, BookingStatus::Disputed]
            }
            BookingStatus::Cancelled => &[BookingStatus::Refunded],
            BookingStatus::Completed => &[],
            BookingStatus::Disputed => &[],
            BookingStatus::Refunded => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::InProgress => "IN_PROGRESS",
            BookingStatus::AwaitingClientConfirmation => "AWAITING_CLIENT_CONFIRMATION",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Disputed => "DISPUTED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "PENDING" => BookingStatus::Pending,
            "CONFIRMED" => BookingStatus::Confirmed,
            "IN_PROGRESS" => BookingStatus::InProgress,
            "AWAITING_CLIENT_CONFIRMATION" => BookingStatus::AwaitingClientConfirmation,
            "COMPLETED" => BookingStatus::Completed,
            "DISPUTED" => BookingStatus::Disputed,
            "CANCELLED" => BookingStatus::Cancelled,
            "REFUNDED" => BookingStatus::Refunded,
            other => {
                return Err(EscrowError::InvalidRequest {
                    message: format!("unknown booking status {other}"),
                    field: Some("status".to_string()),
                })
            }
        };
        Ok(status)
    }
}

/// Why escrow was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseReason {
    /// The client explicitly accepted the work.
    ClientAccepted,
    /// The confirmation deadline passed without a client response.
    AutoReleaseNoClientResponse,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::ClientAccepted => "CLIENT_ACCEPTED",
            ReleaseReason::AutoReleaseNoClientResponse => "AUTO_RELEASE_NO_CLIENT_RESPONSE",
        }
    }
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cancellation details, set when a booking enters CANCELLED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub cancelled_at: DateTime<Utc>,
    pub cancelled_by: UserType,
    pub reason: Option<String>,
}

/// How the provider payout of a booking is derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementBreakdown {
    pub total_amount: Decimal,
    pub commission_amount: Decimal,
    pub provider_amount: Decimal,
    /// True when no commission was stored and the default rate was applied.
    pub commission_defaulted: bool,
}

/// Outcome of the release guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseCheck {
    /// All preconditions hold; the release may proceed.
    Eligible,
    /// The escrow was released earlier; the desired end state already holds.
    AlreadySettled,
}

/// A bookable service engagement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub client_id: ClientId,
    pub provider_id: ProviderId,
    pub status: BookingStatus,
    pub total_amount: Decimal,
    pub commission_amount: Option<Decimal>,
    pub provider_amount: Option<Decimal>,
    pub currency: Currency,
    pub is_paid: bool,
    pub escrow_released: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub client_confirm_deadline: Option<DateTime<Utc>>,
    pub client_confirmed_at: Option<DateTime<Utc>>,
    pub cancellation: Option<Cancellation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Create a new PENDING booking.
    pub fn new(
        client_id: ClientId,
        provider_id: ProviderId,
        total: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: BookingId::new(),
            client_id,
            provider_id,
            status: BookingStatus::Pending,
            total_amount: total.value,
            commission_amount: None,
            provider_amount: None,
            currency: total.currency,
            is_paid: false,
            escrow_released: false,
            completed_at: None,
            client_confirm_deadline: None,
            client_confirmed_at: None,
            cancellation: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set an explicit commission.
    pub fn with_commission(mut self, commission: Decimal) -> Self {
        self.commission_amount = Some(commission);
        self
    }

    /// Set an explicit provider payout.
    pub fn with_provider_amount(mut self, amount: Decimal) -> Self {
        self.provider_amount = Some(amount);
        self
    }

    /// The booking total as money.
    pub fn total(&self) -> Money {
        Money::new(self.total_amount, self.currency.clone())
    }

    /// Transition to a new status.
    pub fn transition_to(
        &mut self,
        next: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Record that the client payment was captured into escrow.
    pub fn mark_paid(&mut self, now: DateTime<Utc>) {
        self.is_paid = true;
        self.updated_at = now;
    }

    /// Provider marks the work done: opens the client confirmation window.
    pub fn mark_work_completed(
        &mut self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<(), InvalidTransition> {
        self.transition_to(BookingStatus::AwaitingClientConfirmation, now)?;

        self.completed_at = Some(now);
        // Entering AWAITING_CLIENT_CONFIRMATION happens once per booking, so
        // the deadline is never overwritten.
        if self.client_confirm_deadline.is_none() {
            self.client_confirm_deadline = Some(now + window);
        }
        Ok(())
    }

    /// Cancel the booking.
    pub fn cancel(
        &mut self,
        by: UserType,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition_to(BookingStatus::Cancelled, now)?;
        self.cancellation = Some(Cancellation {
            cancelled_at: now,
            cancelled_by: by,
            reason,
        });
        Ok(())
    }

    /// Derive the provider payout.
    ///
    /// A stored `provider_amount` wins; otherwise the payout is the total minus
    /// the stored commission, or minus `default_rate` of the total when no
    /// commission was recorded.
    pub fn settlement_breakdown(&self, default_rate: CommissionRate) -> SettlementBreakdown {
        let (commission_amount, commission_defaulted) = match self.commission_amount {
            Some(commission) => (commission, false),
            None => (default_rate.apply(self.total_amount), true),
        };

        let provider_amount = self
            .provider_amount
            .unwrap_or(self.total_amount - commission_amount);

        SettlementBreakdown {
            total_amount: self.total_amount,
            commission_amount,
            provider_amount,
            commission_defaulted,
        }
    }

    /// Evaluate the release guard. `has_dispute` must come from the same
    /// consistent read as `self`.
    pub fn check_release(&self, has_dispute: bool) -> Result<ReleaseCheck, EscrowError> {
        if self.escrow_released {
            return Ok(ReleaseCheck::AlreadySettled);
        }
        self.check_awaiting_confirmation(has_dispute)?;
        if !self.is_paid {
            return Err(EscrowError::precondition(self.id, PreconditionReason::NotPaid));
        }
        Ok(ReleaseCheck::Eligible)
    }

    /// Evaluate the dispute guard.
    pub fn check_dispute(&self, has_dispute: bool) -> Result<(), EscrowError> {
        if self.escrow_released {
            return Err(EscrowError::precondition(
                self.id,
                PreconditionReason::AlreadySettled,
            ));
        }
        self.check_awaiting_confirmation(has_dispute)
    }

    fn check_awaiting_confirmation(&self, has_dispute: bool) -> Result<(), EscrowError> {
        if self.status != BookingStatus::AwaitingClientConfirmation {
            return Err(EscrowError::precondition(
                self.id,
                PreconditionReason::WrongStatus {
                    expected: BookingStatus::AwaitingClientConfirmation,
                    actual: self.status,
                },
            ));
        }
        if has_dispute {
            return Err(EscrowError::precondition(
                self.id,
                PreconditionReason::OpenDispute,
            ));
        }
        Ok(())
    }

    /// Apply the booking side of a settlement: COMPLETED and released.
    pub fn apply_release(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.escrow_released {
            return Err(InvalidTransition {
                from: self.status,
                to: BookingStatus::Completed,
            });
        }
        self.transition_to(BookingStatus::Completed, now)?;
        self.escrow_released = true;
        if self.client_confirmed_at.is_none() {
            self.client_confirmed_at = Some(now);
        }
        Ok(())
    }

    /// Apply the booking side of a dispute.
    pub fn apply_dispute(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition_to(BookingStatus::Disputed, now)
    }

    /// Selection predicate of the auto-release sweep.
    pub fn is_auto_release_eligible(&self, has_dispute: bool, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::AwaitingClientConfirmation
            && self.is_paid
            && !self.escrow_released
            && !has_dispute
            && self
                .client_confirm_deadline
                .is_some_and(|deadline| crate::deadline_reached(deadline, now))
    }

    /// Check the booking-level escrow invariant.
    pub fn escrow_invariant_holds(&self) -> bool {
        !self.escrow_released || self.status == BookingStatus::Completed
    }
}

/// Error when attempting invalid state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: BookingStatus,
    pub to: BookingStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid state transition from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

impl From<InvalidTransition> for EscrowError {
    fn from(err: InvalidTransition) -> Self {
        EscrowError::InvalidTransition {
            from: err.from,
            to: err.to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::client_confirmation_window;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn create_test_booking(total: Decimal) -> Booking {
        Booking::new(
            ClientId::new("client_1"),
            ProviderId::new("provider_1"),
            Money::new(total, Currency::usd()),
            Utc::now(),
        )
    }

    fn awaiting_booking(total: Decimal) -> Booking {
        let now = Utc::now();
        let mut booking = create_test_booking(total);
        booking.mark_paid(now);
        booking.transition_to(BookingStatus::Confirmed, now).unwrap();
        booking.transition_to(BookingStatus::InProgress, now).unwrap();
        booking
            .mark_work_completed(now, client_confirmation_window())
            .unwrap();
        booking
    }

    #[test]
    fn test_booking_creation() {
        let booking = create_test_booking(dec!(100));
        assert_eq!(booking.status, BookingStatus::Pending);
        assert!(!booking.escrow_released);
        assert!(booking.client_confirm_deadline.is_none());
    }

    #[test]
    fn test_valid_lifecycle() {
        let booking = awaiting_booking(dec!(100));
        assert_eq!(booking.status, BookingStatus::AwaitingClientConfirmation);
        let completed_at = booking.completed_at.unwrap();
        assert_eq!(
            booking.client_confirm_deadline,
            Some(completed_at + Duration::hours(48))
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let mut booking = create_test_booking(dec!(100));
        let now = Utc::now();

        assert!(booking.transition_to(BookingStatus::Completed, now).is_err());
        assert!(booking
            .transition_to(BookingStatus::AwaitingClientConfirmation, now)
            .is_err());
        assert_eq!(booking.status, BookingStatus::Pending);
    }

    #[test]
    fn test_status_never_regresses() {
        let mut booking = awaiting_booking(dec!(100));
        let now = Utc::now();
        booking.apply_release(now).unwrap();

        for status in [
            BookingStatus::Pending,
            BookingStatus::InProgress,
            BookingStatus::AwaitingClientConfirmation,
            BookingStatus::Disputed,
        ] {
            assert!(booking.transition_to(status, now).is_err());
        }
        assert_eq!(booking.status, BookingStatus::Completed);
    }

    #[test]
    fn test_terminal_states() {
        for status in [
            BookingStatus::Completed,
            BookingStatus::Disputed,
            BookingStatus::Refunded,
        ] {
            assert!(status.valid_transitions().is_empty());
        }
        assert!(BookingStatus::Cancelled.can_transition_to(BookingStatus::Refunded));
    }

    #[test]
    fn test_status_string_round_trip() {
        let status: BookingStatus = "AWAITING_CLIENT_CONFIRMATION".parse().unwrap();
        assert_eq!(status, BookingStatus::AwaitingClientConfirmation);
        assert!("FINISHED".parse::<BookingStatus>().is_err());

        let json = serde_json::to_string(&BookingStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }

    #[test]
    fn test_breakdown_default_commission() {
        let booking = create_test_booking(dec!(100));
        let breakdown = booking.settlement_breakdown(CommissionRate::DEFAULT);

        assert_eq!(breakdown.commission_amount, dec!(5));
        assert_eq!(breakdown.provider_amount, dec!(95));
        assert!(breakdown.commission_defaulted);
    }

    #[test]
    fn test_breakdown_explicit_amounts() {
        let booking = create_test_booking(dec!(200)).with_commission(dec!(30));
        let breakdown = booking.settlement_breakdown(CommissionRate::DEFAULT);
        assert_eq!(breakdown.provider_amount, dec!(170));
        assert!(!breakdown.commission_defaulted);

        let booking = booking.with_provider_amount(dec!(160));
        assert_eq!(
            booking
                .settlement_breakdown(CommissionRate::DEFAULT)
                .provider_amount,
            dec!(160)
        );
    }

    #[test]
    fn test_release_guard() {
        let booking = awaiting_booking(dec!(100));
        assert_eq!(booking.check_release(false).unwrap(), ReleaseCheck::Eligible);

        let err = booking.check_release(true).unwrap_err();
        assert!(matches!(
            err,
            EscrowError::PreconditionFailed {
                reason: PreconditionReason::OpenDispute,
                ..
            }
        ));

        let mut unpaid = awaiting_booking(dec!(100));
        unpaid.is_paid = false;
        assert!(matches!(
            unpaid.check_release(false),
            Err(EscrowError::PreconditionFailed {
                reason: PreconditionReason::NotPaid,
                ..
            })
        ));
    }

    #[test]
    fn test_release_guard_on_cancelled_booking() {
        let mut booking = create_test_booking(dec!(100));
        booking
            .cancel(UserType::Client, Some("changed plans".into()), Utc::now())
            .unwrap();

        assert!(booking.check_release(false).is_err());
        assert!(booking.check_dispute(false).is_err());
        assert_eq!(
            booking.cancellation.as_ref().unwrap().cancelled_by,
            UserType::Client
        );
    }

    #[test]
    fn test_apply_release_sets_fields_once() {
        let mut booking = awaiting_booking(dec!(100));
        let now = Utc::now();

        booking.apply_release(now).unwrap();
        assert_eq!(booking.status, BookingStatus::Completed);
        assert!(booking.escrow_released);
        assert_eq!(booking.client_confirmed_at, Some(now));
        assert!(booking.escrow_invariant_holds());

        assert_eq!(
            booking.check_release(false).unwrap(),
            ReleaseCheck::AlreadySettled
        );
        assert!(booking.apply_release(now).is_err());
    }

    #[test]
    fn test_auto_release_deadline_boundary() {
        let booking = awaiting_booking(dec!(100));
        let deadline = booking.client_confirm_deadline.unwrap();

        assert!(booking.is_auto_release_eligible(false, deadline));
        assert!(!booking.is_auto_release_eligible(false, deadline - Duration::seconds(1)));
        assert!(!booking.is_auto_release_eligible(true, deadline));
    }

    proptest! {
        #[test]
        fn default_commission_pays_ninety_five_percent(cents in 1i64..10_000_000) {
            let total = Decimal::new(cents, 2);
            let booking = create_test_booking(total);
            let breakdown = booking.settlement_breakdown(CommissionRate::DEFAULT);
            prop_assert_eq!(breakdown.provider_amount, total * dec!(0.95));
            prop_assert_eq!(
                breakdown.provider_amount + breakdown.commission_amount,
                total
            );
        }
    }
}
