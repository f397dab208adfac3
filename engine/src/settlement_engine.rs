//! Settlement engine.
//!
//! Runs the release and dispute units against the store, then emits the
//! post-commit notification.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use escrowsettle_common::{
    Booking, BookingId, ClientId, Clock, CommissionRate, EscrowError, Money, PreconditionReason,
    ProviderId, ReleaseReason, Result, UserType,
};
use escrowsettle_ledger::Transaction;

use crate::dispute_gate::DisputeGate;
use crate::metrics::SharedMetrics;
use crate::notifier::{Notifier, SettlementEvent};
use crate::store::{
    DisputeCommand, DisputeCommit, ReleaseCommand, ReleaseCommit, SettlementStore,
    WorkCompletedCommand,
};

/// A committed release.
#[derive(Debug, Clone)]
pub struct ReleaseReceipt {
    pub booking: Booking,
    pub transaction: Transaction,
    /// Wallet balance after the credit.
    pub wallet_balance: Money,
}

/// Outcome of a release attempt.
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    Released(ReleaseReceipt),
    /// Escrow had already been released; nothing was written.
    AlreadySettled(Booking),
}

impl ReleaseOutcome {
    pub fn booking(&self) -> &Booking {
        match self {
            ReleaseOutcome::Released(receipt) => &receipt.booking,
            ReleaseOutcome::AlreadySettled(booking) => booking,
        }
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        match self {
            ReleaseOutcome::Released(receipt) => Some(&receipt.transaction),
            ReleaseOutcome::AlreadySettled(_) => None,
        }
    }
}

/// Executes settlements atomically and idempotently.
pub struct SettlementEngine {
    store: Arc<dyn SettlementStore>,
    gate: DisputeGate,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    default_commission_rate: CommissionRate,
    metrics: SharedMetrics,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        default_commission_rate: CommissionRate,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            gate: DisputeGate::new(store.clone()),
            store,
            notifier,
            clock,
            default_commission_rate,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn SettlementStore> {
        &self.store
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Release the escrow of a booking to its provider.
    ///
    /// Calling this again for a settled booking returns
    /// [`ReleaseOutcome::AlreadySettled`] and writes nothing.
    #[instrument(skip(self), fields(booking_id = %booking_id, reason = %reason))]
    pub async fn release(
        &self,
        booking_id: BookingId,
        reason: ReleaseReason,
    ) -> Result<ReleaseOutcome> {
        let result = self.release_inner(booking_id, reason).await;
        self.record_failure(booking_id, result.as_ref().err());
        result
    }

    async fn release_inner(
        &self,
        booking_id: BookingId,
        reason: ReleaseReason,
    ) -> Result<ReleaseOutcome> {
        let booking = self
            .store
            .get_booking(booking_id)
            .await?
            .ok_or(EscrowError::BookingNotFound(booking_id))?;

        if !booking.escrow_released && self.gate.has_open_dispute(booking_id).await? {
            return Err(EscrowError::precondition(
                booking_id,
                PreconditionReason::OpenDispute,
            ));
        }

        let command = ReleaseCommand {
            booking_id,
            reason,
            default_commission_rate: self.default_commission_rate,
            now: self.clock.now(),
        };

        match self.store.commit_release(&command).await? {
            ReleaseCommit::AlreadySettled { booking } => {
                self.metrics.already_settled();
                info!(booking_id = %booking_id, "Escrow already released");
                Ok(ReleaseOutcome::AlreadySettled(booking))
            }
            ReleaseCommit::Released {
                booking,
                transaction,
                wallet,
            } => {
                self.metrics
                    .release_committed(reason == ReleaseReason::AutoReleaseNoClientResponse);
                info!(
                    booking_id = %booking_id,
                    provider_id = %booking.provider_id,
                    transaction_id = %transaction.id,
                    amount = %transaction.amount,
                    wallet_balance = %wallet.balance,
                    "Escrow released"
                );

                self.emit(SettlementEvent::payment_released(
                    &booking,
                    transaction.amount,
                    reason,
                    command.now,
                ))
                .await;

                Ok(ReleaseOutcome::Released(ReleaseReceipt {
                    wallet_balance: wallet.balance(),
                    booking,
                    transaction,
                }))
            }
        }
    }

    /// Open a dispute on behalf of the booking's client.
    #[instrument(skip(self, reason), fields(booking_id = %booking_id))]
    pub async fn dispute(
        &self,
        booking_id: BookingId,
        raised_by: &ClientId,
        reason: &str,
    ) -> Result<DisputeCommit> {
        let result = self.dispute_inner(booking_id, raised_by, reason).await;
        self.record_failure(booking_id, result.as_ref().err());
        result
    }

    async fn dispute_inner(
        &self,
        booking_id: BookingId,
        raised_by: &ClientId,
        reason: &str,
    ) -> Result<DisputeCommit> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EscrowError::InvalidRequest {
                message: "dispute reason is required".to_string(),
                field: Some("reason".to_string()),
            });
        }

        let command = DisputeCommand {
            booking_id,
            raised_by: raised_by.to_string(),
            raised_by_type: UserType::Client,
            reason: reason.to_string(),
            now: self.clock.now(),
        };
        let commit = self.store.commit_dispute(&command).await?;

        self.metrics.dispute_opened();
        info!(
            booking_id = %booking_id,
            dispute_id = %commit.dispute.id,
            "Dispute opened"
        );

        self.emit(SettlementEvent::dispute_created(&commit.booking, &commit.dispute))
            .await;

        Ok(commit)
    }

    /// Provider reports the work as done; opens the confirmation window.
    #[instrument(skip(self), fields(booking_id = %booking_id))]
    pub async fn mark_work_completed(
        &self,
        booking_id: BookingId,
        provider_id: &ProviderId,
        confirmation_window: chrono::Duration,
    ) -> Result<Booking> {
        let command = WorkCompletedCommand {
            booking_id,
            provider_id: provider_id.clone(),
            confirmation_window,
            now: self.clock.now(),
        };
        let result = self.store.commit_work_completed(&command).await;
        self.record_failure(booking_id, result.as_ref().err());

        let booking = result?;
        info!(
            booking_id = %booking_id,
            deadline = ?booking.client_confirm_deadline,
            "Work completed, awaiting client confirmation"
        );
        Ok(booking)
    }

    async fn emit(&self, event: SettlementEvent) {
        let booking_id = event.booking_id;
        let event_type = event.event_type;
        if let Err(e) = self.notifier.notify(event).await {
            self.metrics.notifier_failed();
            warn!(
                booking_id = %booking_id,
                event_type = event_type.as_str(),
                error = %e,
                "Failed to deliver settlement notification"
            );
        }
    }

    fn record_failure(&self, booking_id: BookingId, err: Option<&EscrowError>) {
        match err {
            Some(EscrowError::PreconditionFailed { reason, .. }) => {
                self.metrics.precondition_failed();
                warn!(booking_id = %booking_id, reason = %reason, "Settlement precondition failed");
            }
            Some(e @ EscrowError::Persistence(_)) => {
                self.metrics.persistence_failed();
                error!(booking_id = %booking_id, error = %e, "Settlement unit rolled back");
            }
            Some(e) => {
                warn!(booking_id = %booking_id, code = e.error_code(), error = %e, "Settlement rejected");
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::notifier::{ChannelNotifier, EventType, NotifierError};
    use crate::store::{FaultPoint, MemoryStore};
    use chrono::{Duration, Utc};
    use escrowsettle_common::{BookingStatus, Currency, ManualClock};
    use rust_decimal_macros::dec;

    struct FailingNotifier;

    #[async_trait::async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _event: SettlementEvent) -> std::result::Result<(), NotifierError> {
            Err(NotifierError::Delivery("smtp down".to_string()))
        }
    }

    async fn seed(store: &MemoryStore, clock: &ManualClock) -> Booking {
        let now = clock.now();
        let mut booking = Booking::new(
            ClientId::new("client_1"),
            ProviderId::new("provider_1"),
            Money::new(dec!(100), Currency::usd()),
            now,
        );
        booking.mark_paid(now);
        booking.transition_to(BookingStatus::Confirmed, now).unwrap();
        booking.transition_to(BookingStatus::InProgress, now).unwrap();
        booking.mark_work_completed(now, Duration::hours(48)).unwrap();
        store.insert_booking(&booking).await.unwrap();
        booking
    }

    fn engine(
        store: Arc<MemoryStore>,
        notifier: Arc<dyn Notifier>,
        clock: ManualClock,
    ) -> SettlementEngine {
        SettlementEngine::new(
            store,
            notifier,
            Arc::new(clock),
            CommissionRate::DEFAULT,
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn test_release_then_already_settled() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let booking = seed(&store, &clock).await;
        let (notifier, mut rx) = ChannelNotifier::new();
        let engine = engine(store.clone(), Arc::new(notifier), clock);

        let outcome = engine
            .release(booking.id, ReleaseReason::ClientAccepted)
            .await
            .unwrap();
        let ReleaseOutcome::Released(receipt) = outcome else {
            panic!("expected release");
        };
        assert_eq!(receipt.wallet_balance.value, dec!(95));
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::PaymentReleased);

        let again = engine
            .release(booking.id, ReleaseReason::ClientAccepted)
            .await
            .unwrap();
        assert!(matches!(again, ReleaseOutcome::AlreadySettled(_)));
        assert!(again.transaction().is_none());
        assert!(rx.try_recv().is_err());

        let snapshot = engine.metrics.snapshot();
        assert_eq!(snapshot.releases_total, 1);
        assert_eq!(snapshot.releases_already_settled, 1);
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_undo_release() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let booking = seed(&store, &clock).await;
        let engine = engine(store.clone(), Arc::new(FailingNotifier), clock);

        let outcome = engine
            .release(booking.id, ReleaseReason::ClientAccepted)
            .await
            .unwrap();
        assert_eq!(outcome.booking().status, BookingStatus::Completed);
        assert_eq!(engine.metrics.snapshot().notifier_failures, 1);

        let stored = store.get_booking(booking.id).await.unwrap().unwrap();
        assert!(stored.escrow_released);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_counted() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let booking = seed(&store, &clock).await;
        store.inject_fault(booking.id, FaultPoint::WalletUpsert);
        let (notifier, mut rx) = ChannelNotifier::new();
        let engine = engine(store.clone(), Arc::new(notifier), clock);

        let err = engine
            .release(booking.id, ReleaseReason::ClientAccepted)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engine.metrics.snapshot().persistence_failures, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispute_requires_reason() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let booking = seed(&store, &clock).await;
        let (notifier, _rx) = ChannelNotifier::new();
        let engine = engine(store.clone(), Arc::new(notifier), clock);

        let err = engine
            .dispute(booking.id, &booking.client_id, "   ")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REQUEST");

        let commit = engine
            .dispute(booking.id, &booking.client_id, "work not done")
            .await
            .unwrap();
        assert_eq!(commit.booking.status, BookingStatus::Disputed);
        assert_eq!(commit.dispute.reason, "work not done");

        let err = engine
            .release(booking.id, ReleaseReason::ClientAccepted)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::PreconditionFailed {
                reason: PreconditionReason::OpenDispute,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_booking() {
        let store = Arc::new(MemoryStore::new());
        let (notifier, _rx) = ChannelNotifier::new();
        let engine = engine(store, Arc::new(notifier), ManualClock::new(Utc::now()));

        let err = engine
            .release(BookingId::new(), ReleaseReason::ClientAccepted)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "BOOKING_NOT_FOUND");
    }
}
