//! In-process store.
//!
//! All tables sit behind one mutex, so every unit observes and mutates a
//! consistent snapshot. Writes are staged on copies and applied only after
//! every step has succeeded.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use escrowsettle_common::{
    Booking, BookingId, BookingStatus, Dispute, EscrowError, Money, PreconditionReason,
    ProviderId, ReleaseCheck, Result,
};
use escrowsettle_ledger::{
    upsert_credit, IntegrityReport, LedgerAudit, ProviderWallet, Transaction, TransactionJournal,
};

use super::{
    AutoReleaseHold, DisputeCommand, DisputeCommit, ReleaseCommand, ReleaseCommit,
    SettlementStore, WorkCompletedCommand,
};
use crate::dispute_gate::blocks_settlement;

/// Step of the release unit at which an injected fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// Before the booking row is updated.
    BookingUpdate,
    /// After the booking update, before the ledger row is appended.
    TransactionInsert,
    /// After the ledger row, before the wallet upsert.
    WalletUpsert,
}

#[derive(Default)]
struct Tables {
    bookings: HashMap<BookingId, Booking>,
    disputes: HashMap<BookingId, Dispute>,
    journal: TransactionJournal,
    wallets: HashMap<ProviderId, ProviderWallet>,
    holds: HashMap<BookingId, AutoReleaseHold>,
}

/// Store keeping every table in memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// One-shot faults keyed by booking.
    faults: DashMap<BookingId, FaultPoint>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next release unit of `booking_id` fail at `point`.
    pub fn inject_fault(&self, booking_id: BookingId, point: FaultPoint) {
        self.faults.insert(booking_id, point);
    }

    /// Insert a dispute created outside the client dispute flow.
    pub fn insert_dispute(&self, dispute: Dispute) {
        self.tables.lock().disputes.insert(dispute.booking_id, dispute);
    }

    /// Every ledger row, in append order.
    pub fn all_transactions(&self) -> Vec<Transaction> {
        self.tables.lock().journal.entries().to_vec()
    }

    /// Audit the current contents.
    pub fn audit(&self) -> IntegrityReport {
        let tables = self.tables.lock();
        let bookings: Vec<Booking> = tables.bookings.values().cloned().collect();
        let wallets: Vec<ProviderWallet> = tables.wallets.values().cloned().collect();
        LedgerAudit::verify_integrity(&bookings, tables.journal.entries(), &wallets)
    }

    fn trip(&self, booking_id: BookingId, point: FaultPoint) -> Result<()> {
        if self
            .faults
            .remove_if(&booking_id, |_, armed| *armed == point)
            .is_some()
        {
            debug!(booking_id = %booking_id, ?point, "Injected fault triggered");
            return Err(EscrowError::Persistence(format!(
                "injected fault at {point:?}"
            )));
        }
        Ok(())
    }

    fn release_unit(&self, command: &ReleaseCommand) -> Result<ReleaseCommit> {
        let mut tables = self.tables.lock();
        let id = command.booking_id;

        let booking = tables
            .bookings
            .get(&id)
            .cloned()
            .ok_or(EscrowError::BookingNotFound(id))?;
        let has_dispute = blocks_settlement(tables.disputes.get(&id));

        if booking.check_release(has_dispute)? == ReleaseCheck::AlreadySettled {
            return Ok(ReleaseCommit::AlreadySettled { booking });
        }

        let breakdown = booking.settlement_breakdown(command.default_commission_rate);

        self.trip(id, FaultPoint::BookingUpdate)?;
        let mut staged_booking = booking.clone();
        staged_booking.apply_release(command.now)?;

        self.trip(id, FaultPoint::TransactionInsert)?;
        let transaction =
            Transaction::escrow_release(&booking, &breakdown, command.reason, command.now);
        tables.journal.check_append(&transaction)?;

        self.trip(id, FaultPoint::WalletUpsert)?;
        let credit = Money::new(breakdown.provider_amount, booking.currency.clone());
        let wallet = upsert_credit(
            tables.wallets.get(&booking.provider_id).cloned(),
            &booking.provider_id,
            &credit,
            command.now,
        )?;

        tables.bookings.insert(id, staged_booking.clone());
        tables.journal.append(transaction.clone())?;
        tables
            .wallets
            .insert(booking.provider_id.clone(), wallet.clone());

        Ok(ReleaseCommit::Released {
            booking: staged_booking,
            transaction,
            wallet,
        })
    }

    fn dispute_unit(&self, command: &DisputeCommand) -> Result<DisputeCommit> {
        let mut tables = self.tables.lock();
        let id = command.booking_id;

        let mut booking = tables
            .bookings
            .get(&id)
            .cloned()
            .ok_or(EscrowError::BookingNotFound(id))?;
        booking.check_dispute(blocks_settlement(tables.disputes.get(&id)))?;
        booking.apply_dispute(command.now)?;

        let dispute = Dispute::open(
            id,
            command.raised_by.clone(),
            command.raised_by_type,
            command.reason.clone(),
            command.now,
        );

        tables.bookings.insert(id, booking.clone());
        tables.disputes.insert(id, dispute.clone());

        Ok(DisputeCommit { booking, dispute })
    }

    fn work_completed_unit(&self, command: &WorkCompletedCommand) -> Result<Booking> {
        let mut tables = self.tables.lock();
        let id = command.booking_id;

        let booking = tables
            .bookings
            .get_mut(&id)
            .ok_or(EscrowError::BookingNotFound(id))?;
        if booking.provider_id != command.provider_id {
            return Err(EscrowError::Unauthorized {
                booking_id: id,
                actor: command.provider_id.to_string(),
            });
        }
        if booking.status != BookingStatus::InProgress {
            return Err(EscrowError::precondition(
                id,
                PreconditionReason::WrongStatus {
                    expected: BookingStatus::InProgress,
                    actual: booking.status,
                },
            ));
        }

        let mut staged = booking.clone();
        staged.mark_work_completed(command.now, command.confirmation_window)?;
        *booking = staged.clone();
        Ok(staged)
    }

    fn candidates(&self, now: DateTime<Utc>, limit: usize) -> Vec<BookingId> {
        let tables = self.tables.lock();
        let mut eligible: Vec<&Booking> = tables
            .bookings
            .values()
            .filter(|b| !tables.holds.contains_key(&b.id))
            .filter(|b| {
                b.is_auto_release_eligible(blocks_settlement(tables.disputes.get(&b.id)), now)
            })
            .collect();
        eligible.sort_by_key(|b| (b.client_confirm_deadline, b.id));
        eligible.into_iter().take(limit).map(|b| b.id).collect()
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn insert_booking(&self, booking: &Booking) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.bookings.contains_key(&booking.id) {
            return Err(EscrowError::Persistence(format!(
                "duplicate booking id {}",
                booking.id
            )));
        }
        tables.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn get_booking(&self, booking_id: BookingId) -> Result<Option<Booking>> {
        Ok(self.tables.lock().bookings.get(&booking_id).cloned())
    }

    async fn get_dispute(&self, booking_id: BookingId) -> Result<Option<Dispute>> {
        Ok(self.tables.lock().disputes.get(&booking_id).cloned())
    }

    async fn get_wallet(&self, provider_id: &ProviderId) -> Result<Option<ProviderWallet>> {
        Ok(self.tables.lock().wallets.get(provider_id).cloned())
    }

    async fn transactions_for_booking(&self, booking_id: BookingId) -> Result<Vec<Transaction>> {
        Ok(self.tables.lock().journal.for_booking(&booking_id))
    }

    async fn find_auto_release_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BookingId>> {
        Ok(self.candidates(now, limit))
    }

    async fn commit_work_completed(&self, command: &WorkCompletedCommand) -> Result<Booking> {
        self.work_completed_unit(command)
    }

    async fn commit_release(&self, command: &ReleaseCommand) -> Result<ReleaseCommit> {
        self.release_unit(command)
    }

    async fn commit_dispute(&self, command: &DisputeCommand) -> Result<DisputeCommit> {
        self.dispute_unit(command)
    }

    async fn hold_auto_release(&self, hold: &AutoReleaseHold) -> Result<()> {
        let mut tables = self.tables.lock();
        if !tables.bookings.contains_key(&hold.booking_id) {
            return Err(EscrowError::BookingNotFound(hold.booking_id));
        }
        tables.holds.insert(hold.booking_id, hold.clone());
        Ok(())
    }

    async fn get_auto_release_hold(
        &self,
        booking_id: BookingId,
    ) -> Result<Option<AutoReleaseHold>> {
        Ok(self.tables.lock().holds.get(&booking_id).cloned())
    }

    async fn clear_auto_release_hold(&self, booking_id: BookingId) -> Result<bool> {
        Ok(self.tables.lock().holds.remove(&booking_id).is_some())
    }
}
