//! Auto-release sweep.
//!
//! The scheduler keeps no state between runs: every sweep re-selects its
//! candidates from the store, so overlapping runs or repeated invocations
//! settle each booking at most once. A booking whose release fails with a
//! non-retryable error is put on hold in the store so it cannot crowd out
//! later candidates; persistence failures stay eligible.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use escrowsettle_common::{limits, BookingId, EscrowError, ReleaseReason, Result};

use crate::settlement_engine::{ReleaseOutcome, SettlementEngine};
use crate::store::AutoReleaseHold;

/// A booking the sweep could not settle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoReleaseFailure {
    pub booking_id: BookingId,
    pub code: String,
    pub message: String,
    /// Whether the booking was held out of later sweeps.
    pub held: bool,
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutoReleaseSummary {
    pub released_count: usize,
    /// Nominal sum of provider payouts released in this sweep.
    pub total_released: Decimal,
    /// Candidates that were settled or disputed by someone else in the meantime.
    pub skipped_count: usize,
    pub errors: Vec<AutoReleaseFailure>,
}

/// Releases escrow for bookings whose confirmation deadline passed.
pub struct AutoReleaseScheduler {
    engine: Arc<SettlementEngine>,
    concurrency: usize,
}

impl AutoReleaseScheduler {
    pub fn new(engine: Arc<SettlementEngine>, concurrency: usize) -> Self {
        Self {
            engine,
            concurrency: concurrency.max(1),
        }
    }

    /// Run one sweep over at most `batch_size` candidates.
    ///
    /// A failure on one booking is recorded in the summary and does not stop
    /// the sweep. Only a failure to select candidates is returned as an error.
    pub async fn run_once(&self, batch_size: usize) -> Result<AutoReleaseSummary> {
        if batch_size == 0 {
            debug!("Auto-release sweep with empty batch");
            return Ok(AutoReleaseSummary::default());
        }
        let limit = batch_size.min(limits::MAX_AUTO_RELEASE_BATCH);
        let now = self.engine.now();
        self.engine.metrics().scheduler_run();

        let candidates = self
            .engine
            .store()
            .find_auto_release_candidates(now, limit)
            .await?;

        debug!(candidates = candidates.len(), limit, "Auto-release candidates selected");

        let results: Vec<(BookingId, Result<ReleaseOutcome>)> = stream::iter(candidates)
            .map(|booking_id| async move {
                let result = self
                    .engine
                    .release(booking_id, ReleaseReason::AutoReleaseNoClientResponse)
                    .await;
                (booking_id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = AutoReleaseSummary::default();
        for (booking_id, result) in results {
            match result {
                Ok(ReleaseOutcome::Released(receipt)) => {
                    summary.released_count += 1;
                    summary.total_released += receipt.transaction.amount;
                }
                Ok(ReleaseOutcome::AlreadySettled(_))
                | Err(EscrowError::PreconditionFailed { .. }) => {
                    summary.skipped_count += 1;
                }
                Err(e) => {
                    let held = !e.is_retryable() && self.hold(booking_id, &e).await;
                    summary.errors.push(AutoReleaseFailure {
                        booking_id,
                        code: e.error_code().to_string(),
                        message: e.to_string(),
                        held,
                    });
                }
            }
        }

        info!(
            released = summary.released_count,
            total_released = %summary.total_released,
            skipped = summary.skipped_count,
            errors = summary.errors.len(),
            "Auto-release sweep finished"
        );

        Ok(summary)
    }

    /// Keep a booking that fails the same way on every attempt out of later
    /// sweeps. Returns whether the hold was recorded.
    async fn hold(&self, booking_id: BookingId, cause: &EscrowError) -> bool {
        let hold = AutoReleaseHold {
            booking_id,
            error_code: cause.error_code().to_string(),
            message: cause.to_string(),
            held_at: self.engine.now(),
        };

        match self.engine.store().hold_auto_release(&hold).await {
            Ok(()) => {
                warn!(
                    booking_id = %booking_id,
                    code = %hold.error_code,
                    "Booking held from auto-release"
                );
                self.engine.metrics().auto_release_held();
                true
            }
            Err(e) => {
                error!(booking_id = %booking_id, error = %e, "Failed to hold booking");
                false
            }
        }
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run_forever(
        &self,
        batch_size: usize,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once(batch_size).await {
                        Ok(summary) if !summary.errors.is_empty() => {
                            warn!(errors = summary.errors.len(), "Auto-release sweep had failures");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Auto-release sweep failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Auto-release scheduler stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::notifier::TracingNotifier;
    use crate::store::{FaultPoint, MemoryStore, SettlementStore};
    use chrono::{Duration as ChronoDuration, Utc};
    use escrowsettle_common::{
        Booking, BookingStatus, ClientId, Clock, CommissionRate, Currency, ManualClock, Money,
        ProviderId,
    };
    use rust_decimal_macros::dec;

    async fn seed(store: &MemoryStore, clock: &ManualClock, total: Decimal) -> Booking {
        let now = clock.now();
        let mut booking = Booking::new(
            ClientId::new("client_1"),
            ProviderId::new("provider_1"),
            Money::new(total, Currency::usd()),
            now,
        );
        booking.mark_paid(now);
        booking.transition_to(BookingStatus::Confirmed, now).unwrap();
        booking.transition_to(BookingStatus::InProgress, now).unwrap();
        booking.mark_work_completed(now, ChronoDuration::hours(48)).unwrap();
        store.insert_booking(&booking).await.unwrap();
        booking
    }

    fn scheduler(store: Arc<MemoryStore>, clock: ManualClock) -> AutoReleaseScheduler {
        let engine = SettlementEngine::new(
            store,
            Arc::new(TracingNotifier),
            Arc::new(clock),
            CommissionRate::DEFAULT,
            Arc::new(Metrics::new()),
        );
        AutoReleaseScheduler::new(Arc::new(engine), 4)
    }

    #[tokio::test]
    async fn test_sweep_releases_expired_only() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let expired = seed(&store, &clock, dec!(100)).await;
        clock.advance(ChronoDuration::hours(24));
        let fresh = seed(&store, &clock, dec!(40)).await;
        clock.advance(ChronoDuration::hours(25));

        let scheduler = scheduler(store.clone(), clock);
        let summary = scheduler.run_once(50).await.unwrap();

        assert_eq!(summary.released_count, 1);
        assert_eq!(summary.total_released, dec!(95));
        assert!(summary.errors.is_empty());

        let fresh = store.get_booking(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, BookingStatus::AwaitingClientConfirmation);
        let expired = store.get_booking(expired.id).await.unwrap().unwrap();
        assert!(expired.escrow_released);

        let second = scheduler.run_once(50).await.unwrap();
        assert_eq!(second, AutoReleaseSummary::default());
    }

    #[tokio::test]
    async fn test_batch_size_bounds_sweep() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        for _ in 0..5 {
            seed(&store, &clock, dec!(10)).await;
        }
        clock.advance(ChronoDuration::hours(48));

        let scheduler = scheduler(store.clone(), clock);
        assert_eq!(scheduler.run_once(2).await.unwrap().released_count, 2);
        assert_eq!(scheduler.run_once(0).await.unwrap(), AutoReleaseSummary::default());
        assert_eq!(scheduler.run_once(500).await.unwrap().released_count, 3);
    }

    #[tokio::test]
    async fn test_failure_isolated_per_booking() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let broken = seed(&store, &clock, dec!(100)).await;
        seed(&store, &clock, dec!(200)).await;
        store.inject_fault(broken.id, FaultPoint::TransactionInsert);
        clock.advance(ChronoDuration::hours(48));

        let scheduler = scheduler(store.clone(), clock);
        let summary = scheduler.run_once(50).await.unwrap();

        assert_eq!(summary.released_count, 1);
        assert_eq!(summary.total_released, dec!(190));
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].booking_id, broken.id);
        assert_eq!(summary.errors[0].code, "PERSISTENCE_FAILURE");
        assert!(!summary.errors[0].held);

        let retry = scheduler.run_once(50).await.unwrap();
        assert_eq!(retry.released_count, 1);
        assert!(store.audit().is_clean());
    }

    #[tokio::test]
    async fn test_permanent_failures_do_not_starve_queue() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());

        // The provider's wallet is in USD; its EUR bookings can never settle.
        let funded = seed(&store, &clock, dec!(100)).await;
        store
            .commit_release(&crate::store::ReleaseCommand {
                booking_id: funded.id,
                reason: ReleaseReason::ClientAccepted,
                default_commission_rate: CommissionRate::DEFAULT,
                now: clock.now(),
            })
            .await
            .unwrap();
        let mut mismatched = Vec::new();
        for _ in 0..3 {
            let now = clock.now();
            let mut booking = Booking::new(
                ClientId::new("client_1"),
                ProviderId::new("provider_1"),
                Money::new(dec!(50), Currency::eur()),
                now,
            );
            booking.mark_paid(now);
            booking.transition_to(BookingStatus::Confirmed, now).unwrap();
            booking.transition_to(BookingStatus::InProgress, now).unwrap();
            booking.mark_work_completed(now, ChronoDuration::hours(48)).unwrap();
            store.insert_booking(&booking).await.unwrap();
            mismatched.push(booking.id);
            clock.advance(ChronoDuration::minutes(1));
        }
        let queued = seed(&store, &clock, dec!(20)).await;
        clock.advance(ChronoDuration::hours(49));

        let scheduler = scheduler(store.clone(), clock);
        let first = scheduler.run_once(3).await.unwrap();
        assert_eq!(first.released_count, 0);
        assert_eq!(first.errors.len(), 3);
        assert!(first
            .errors
            .iter()
            .all(|f| f.held && f.code == "CURRENCY_MISMATCH"));

        let second = scheduler.run_once(3).await.unwrap();
        assert_eq!(second.released_count, 1);
        assert!(second.errors.is_empty());
        assert!(store.get_booking(queued.id).await.unwrap().unwrap().escrow_released);

        for id in mismatched {
            let hold = store.get_auto_release_hold(id).await.unwrap().unwrap();
            assert_eq!(hold.error_code, "CURRENCY_MISMATCH");
        }
        assert_eq!(scheduler.engine.metrics().snapshot().auto_release_holds, 3);
    }

    #[tokio::test]
    async fn test_run_forever_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(store, ManualClock::new(Utc::now()));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            scheduler
                .run_forever(50, Duration::from_millis(10), rx)
                .await;
            scheduler
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        let scheduler = handle.await.unwrap();
        assert!(scheduler.engine.metrics().snapshot().scheduler_runs >= 1);
    }
}
