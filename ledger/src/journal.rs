//! Append-only transaction journal.

use std::collections::HashMap;

use escrowsettle_common::BookingId;

use crate::error::{LedgerError, LedgerResult};
use crate::transaction::Transaction;

/// In-process journal of ledger rows. Rows are never updated or removed.
#[derive(Debug, Clone, Default)]
pub struct TransactionJournal {
    entries: Vec<Transaction>,
    /// Index of the completed escrow release per booking.
    releases: HashMap<BookingId, usize>,
}

impl TransactionJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `entry` could be appended without violating the
    /// one-completed-release-per-booking rule.
    pub fn check_append(&self, entry: &Transaction) -> LedgerResult<()> {
        if entry.is_completed_release() && self.releases.contains_key(&entry.booking_id) {
            return Err(LedgerError::DuplicateRelease(entry.booking_id));
        }
        Ok(())
    }

    /// Append a row.
    pub fn append(&mut self, entry: Transaction) -> LedgerResult<()> {
        self.check_append(&entry)?;

        if entry.is_completed_release() {
            self.releases.insert(entry.booking_id, self.entries.len());
        }
        self.entries.push(entry);
        Ok(())
    }

    /// All rows, in append order.
    pub fn entries(&self) -> &[Transaction] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows recorded for a booking.
    pub fn for_booking(&self, booking_id: &BookingId) -> Vec<Transaction> {
        self.entries
            .iter()
            .filter(|e| &e.booking_id == booking_id)
            .cloned()
            .collect()
    }

    /// The completed escrow release of a booking, if any.
    pub fn completed_release(&self, booking_id: &BookingId) -> Option<&Transaction> {
        self.releases.get(booking_id).map(|&idx| &self.entries[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use escrowsettle_common::{
        Booking, ClientId, CommissionRate, Currency, Money, ProviderId, ReleaseReason,
    };
    use rust_decimal_macros::dec;

    fn release_for(booking: &Booking) -> Transaction {
        let breakdown = booking.settlement_breakdown(CommissionRate::DEFAULT);
        Transaction::escrow_release(booking, &breakdown, ReleaseReason::ClientAccepted, Utc::now())
    }

    fn booking() -> Booking {
        Booking::new(
            ClientId::new("client_1"),
            ProviderId::new("provider_1"),
            Money::new(dec!(100), Currency::usd()),
            Utc::now(),
        )
    }

    #[test]
    fn test_append_and_lookup() {
        let booking = booking();
        let mut journal = TransactionJournal::new();

        journal.append(release_for(&booking)).unwrap();

        assert_eq!(journal.len(), 1);
        assert_eq!(journal.for_booking(&booking.id).len(), 1);
        assert!(journal.completed_release(&booking.id).is_some());
        assert_eq!(journal.completed_release(&booking.id).unwrap().amount, dec!(95));
    }

    #[test]
    fn test_second_completed_release_rejected() {
        let booking = booking();
        let mut journal = TransactionJournal::new();

        journal.append(release_for(&booking)).unwrap();
        let err = journal.append(release_for(&booking)).unwrap_err();

        assert!(matches!(err, LedgerError::DuplicateRelease(id) if id == booking.id));
        assert_eq!(journal.len(), 1);
    }
}
