//! Escrow service: the operations exposed to the booking API and the worker.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use escrowsettle_common::{
    Booking, BookingId, ClientId, Clock, Dispute, EscrowError, ProviderId, ReleaseReason, Result,
};
use escrowsettle_ledger::Transaction;

use crate::config::EngineConfig;
use crate::metrics::{Metrics, SharedMetrics};
use crate::notifier::Notifier;
use crate::scheduler::{AutoReleaseScheduler, AutoReleaseSummary};
use crate::settlement_engine::{ReleaseOutcome, SettlementEngine};
use crate::store::SettlementStore;

/// What the client decided about the finished work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientAction {
    Accept,
    Dispute { reason: String },
}

/// Client confirmation of a completed booking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmCompletionRequest {
    pub booking_id: BookingId,
    /// Authenticated user submitting the request.
    pub actor_id: ClientId,
    #[serde(flatten)]
    pub action: ClientAction,
}

/// Result of a client confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmCompletionResponse {
    pub success: bool,
    pub booking: Booking,
    /// Ledger row written by this call; `None` when the escrow was already
    /// released or the client disputed.
    pub transaction_created: Option<Transaction>,
    pub dispute: Option<Dispute>,
}

/// Escrow operations over a settlement store.
pub struct EscrowService {
    config: EngineConfig,
    engine: Arc<SettlementEngine>,
    scheduler: AutoReleaseScheduler,
    metrics: SharedMetrics,
}

impl EscrowService {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn SettlementStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let engine = Arc::new(SettlementEngine::new(
            store,
            notifier,
            clock,
            config.default_commission_rate,
            metrics.clone(),
        ));
        let scheduler = AutoReleaseScheduler::new(engine.clone(), config.auto_release.concurrency);

        Self {
            config,
            engine,
            scheduler,
            metrics,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn scheduler(&self) -> &AutoReleaseScheduler {
        &self.scheduler
    }

    pub fn engine(&self) -> &Arc<SettlementEngine> {
        &self.engine
    }

    /// Client accepts the work or disputes it.
    #[instrument(skip(self, request), fields(booking_id = %request.booking_id))]
    pub async fn confirm_completion(
        &self,
        request: ConfirmCompletionRequest,
    ) -> Result<ConfirmCompletionResponse> {
        let booking = self
            .engine
            .store()
            .get_booking(request.booking_id)
            .await?
            .ok_or(EscrowError::BookingNotFound(request.booking_id))?;

        if booking.client_id != request.actor_id {
            return Err(EscrowError::Unauthorized {
                booking_id: booking.id,
                actor: request.actor_id.to_string(),
            });
        }

        match request.action {
            ClientAction::Accept => {
                let outcome = self
                    .engine
                    .release(booking.id, ReleaseReason::ClientAccepted)
                    .await?;
                let transaction_created = outcome.transaction().cloned();
                let booking = match outcome {
                    ReleaseOutcome::Released(receipt) => receipt.booking,
                    ReleaseOutcome::AlreadySettled(booking) => booking,
                };

                Ok(ConfirmCompletionResponse {
                    success: true,
                    booking,
                    transaction_created,
                    dispute: None,
                })
            }
            ClientAction::Dispute { reason } => {
                let commit = self
                    .engine
                    .dispute(booking.id, &request.actor_id, &reason)
                    .await?;

                Ok(ConfirmCompletionResponse {
                    success: true,
                    booking: commit.booking,
                    transaction_created: None,
                    dispute: Some(commit.dispute),
                })
            }
        }
    }

    /// Provider marks the booking's work as done.
    pub async fn mark_work_completed(
        &self,
        booking_id: BookingId,
        provider_id: &ProviderId,
    ) -> Result<Booking> {
        self.engine
            .mark_work_completed(booking_id, provider_id, self.config.confirmation_window)
            .await
    }

    /// Run one auto-release sweep. `None` uses the configured batch size.
    pub async fn run_auto_release(&self, batch_size: Option<usize>) -> Result<AutoReleaseSummary> {
        let batch_size = batch_size.unwrap_or(self.config.auto_release.batch_size);
        let summary = self.scheduler.run_once(batch_size).await?;
        info!(
            released = summary.released_count,
            skipped = summary.skipped_count,
            "Auto-release run complete"
        );
        Ok(summary)
    }

    /// Let the sweep pick a held booking up again, once the cause is fixed.
    /// Returns whether a hold was lifted.
    #[instrument(skip(self))]
    pub async fn clear_auto_release_hold(&self, booking_id: BookingId) -> Result<bool> {
        let cleared = self
            .engine
            .store()
            .clear_auto_release_hold(booking_id)
            .await?;
        if cleared {
            info!(booking_id = %booking_id, "Auto-release hold cleared");
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::TracingNotifier;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use escrowsettle_common::{BookingStatus, Currency, ManualClock, Money};
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    async fn setup() -> (EscrowService, Arc<MemoryStore>, Booking) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
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
        store.insert_booking(&booking).await.unwrap();

        let service = EscrowService::new(
            EngineConfig::default(),
            store.clone(),
            Arc::new(TracingNotifier),
            Arc::new(clock),
        );
        (service, store, booking)
    }

    #[tokio::test]
    async fn test_accept_flow() {
        let (service, _store, booking) = setup().await;

        let updated = service
            .mark_work_completed(booking.id, &booking.provider_id)
            .await
            .unwrap();
        assert_eq!(updated.status, BookingStatus::AwaitingClientConfirmation);

        let response = assert_ok!(
            service
                .confirm_completion(ConfirmCompletionRequest {
                    booking_id: booking.id,
                    actor_id: booking.client_id.clone(),
                    action: ClientAction::Accept,
                })
                .await
        );

        assert!(response.success);
        assert_eq!(response.booking.status, BookingStatus::Completed);
        assert_eq!(response.transaction_created.unwrap().amount, dec!(95));
    }

    #[tokio::test]
    async fn test_only_client_may_confirm() {
        let (service, _store, booking) = setup().await;
        service
            .mark_work_completed(booking.id, &booking.provider_id)
            .await
            .unwrap();

        let err = assert_err!(
            service
                .confirm_completion(ConfirmCompletionRequest {
                    booking_id: booking.id,
                    actor_id: ClientId::new("intruder"),
                    action: ClientAction::Accept,
                })
                .await
        );
        assert_eq!(err.error_code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_accept_before_work_completed() {
        let (service, store, booking) = setup().await;

        let err = service
            .confirm_completion(ConfirmCompletionRequest {
                booking_id: booking.id,
                actor_id: booking.client_id.clone(),
                action: ClientAction::Accept,
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PRECONDITION_FAILED");
        assert!(store.all_transactions().is_empty());
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::json!({
            "booking_id": BookingId::new(),
            "actor_id": "client_1",
            "action": "DISPUTE",
            "reason": "never showed up",
        });
        let request: ConfirmCompletionRequest = serde_json::from_value(json).unwrap();
        assert_eq!(
            request.action,
            ClientAction::Dispute {
                reason: "never showed up".to_string()
            }
        );
    }
}
