//! Persistence boundary for bookings, disputes, wallets and the ledger.
//!
//! Every `commit_*` method is one atomic unit: the guard is evaluated against
//! the state read inside the unit, and either every write lands or none does.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use escrowsettle_common::{
    Booking, BookingId, CommissionRate, Dispute, ProviderId, ReleaseReason, Result, UserType,
};
use escrowsettle_ledger::{ProviderWallet, Transaction};

pub mod memory;
pub mod postgres;

pub use memory::{FaultPoint, MemoryStore};
pub use postgres::PgStore;

/// Settle a booking's escrow.
#[derive(Debug, Clone)]
pub struct ReleaseCommand {
    pub booking_id: BookingId,
    pub reason: ReleaseReason,
    /// Applied when the booking carries no commission.
    pub default_commission_rate: CommissionRate,
    pub now: DateTime<Utc>,
}

/// Result of a release unit.
#[derive(Debug, Clone)]
pub enum ReleaseCommit {
    /// The unit committed: booking COMPLETED, ledger row appended, wallet credited.
    Released {
        booking: Booking,
        transaction: Transaction,
        wallet: ProviderWallet,
    },
    /// The compare-and-set matched nothing: escrow was already released.
    AlreadySettled { booking: Booking },
}

/// Open a dispute on a booking.
#[derive(Debug, Clone)]
pub struct DisputeCommand {
    pub booking_id: BookingId,
    pub raised_by: String,
    pub raised_by_type: UserType,
    pub reason: String,
    pub now: DateTime<Utc>,
}

/// Result of a dispute unit.
#[derive(Debug, Clone)]
pub struct DisputeCommit {
    pub booking: Booking,
    pub dispute: Dispute,
}

/// Provider marks the work as done.
#[derive(Debug, Clone)]
pub struct WorkCompletedCommand {
    pub booking_id: BookingId,
    pub provider_id: ProviderId,
    pub confirmation_window: Duration,
    pub now: DateTime<Utc>,
}

/// A booking the sweep stopped retrying because its release fails the same
/// way every time. Held bookings are skipped by candidate selection until the
/// hold is cleared; client acceptance is unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoReleaseHold {
    pub booking_id: BookingId,
    pub error_code: String,
    pub message: String,
    pub held_at: DateTime<Utc>,
}

/// Transactional storage used by the settlement engine.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Insert a booking created by the upstream request flow.
    async fn insert_booking(&self, booking: &Booking) -> Result<()>;

    async fn get_booking(&self, booking_id: BookingId) -> Result<Option<Booking>>;

    async fn get_dispute(&self, booking_id: BookingId) -> Result<Option<Dispute>>;

    async fn get_wallet(&self, provider_id: &ProviderId) -> Result<Option<ProviderWallet>>;

    async fn transactions_for_booking(&self, booking_id: BookingId) -> Result<Vec<Transaction>>;

    /// Bookings whose confirmation deadline has been reached at `now`, paid,
    /// unreleased, undisputed and not held, oldest deadline first.
    async fn find_auto_release_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BookingId>>;

    /// IN_PROGRESS -> AWAITING_CLIENT_CONFIRMATION, stamping the deadline.
    async fn commit_work_completed(&self, command: &WorkCompletedCommand) -> Result<Booking>;

    /// Settlement unit, guarded by compare-and-set on `escrow_released`.
    async fn commit_release(&self, command: &ReleaseCommand) -> Result<ReleaseCommit>;

    /// Dispute unit: AWAITING_CLIENT_CONFIRMATION -> DISPUTED plus the dispute row.
    async fn commit_dispute(&self, command: &DisputeCommand) -> Result<DisputeCommit>;

    /// Record or refresh an auto-release hold.
    async fn hold_auto_release(&self, hold: &AutoReleaseHold) -> Result<()>;

    async fn get_auto_release_hold(&self, booking_id: BookingId)
        -> Result<Option<AutoReleaseHold>>;

    /// Lift a hold. Returns whether one existed.
    async fn clear_auto_release_hold(&self, booking_id: BookingId) -> Result<bool>;
}
