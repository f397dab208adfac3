//! Ledger integrity audit.

use std::collections::HashMap;

use escrowsettle_common::{Booking, BookingId, BookingStatus, ProviderId};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::transaction::Transaction;
use crate::wallet::ProviderWallet;

/// A broken ledger invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    /// escrow_released is set but the booking is not COMPLETED.
    ReleasedButNotCompleted {
        booking_id: BookingId,
        status: BookingStatus,
    },
    /// The number of completed escrow releases does not match the flag.
    ReleaseCountMismatch {
        booking_id: BookingId,
        escrow_released: bool,
        completed_releases: usize,
    },
    /// Wallet balance differs from the sum of releases credited to it.
    WalletBalanceMismatch {
        provider_id: ProviderId,
        wallet_balance: Decimal,
        released_total: Decimal,
    },
}

/// Result of an audit pass.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub bookings_checked: usize,
    pub violations: Vec<IntegrityViolation>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Checks the settlement invariants over a consistent snapshot of the tables.
pub struct LedgerAudit;

impl LedgerAudit {
    /// Verify:
    /// - escrow_released implies COMPLETED,
    /// - exactly one completed ESCROW_RELEASE per released booking, none otherwise,
    /// - every wallet balance equals the releases credited to its provider.
    ///
    /// Wallet balances are only comparable when the snapshot covers every
    /// booking of the provider.
    pub fn verify_integrity(
        bookings: &[Booking],
        transactions: &[Transaction],
        wallets: &[ProviderWallet],
    ) -> IntegrityReport {
        let mut report = IntegrityReport {
            bookings_checked: bookings.len(),
            violations: Vec::new(),
        };

        let mut releases: HashMap<BookingId, usize> = HashMap::new();
        let mut released_by_provider: HashMap<&str, Decimal> = HashMap::new();
        for tx in transactions.iter().filter(|t| t.is_completed_release()) {
            *releases.entry(tx.booking_id).or_default() += 1;
            *released_by_provider.entry(tx.user_id.as_str()).or_default() += tx.amount;
        }

        for booking in bookings {
            if !booking.escrow_invariant_holds() {
                report.violations.push(IntegrityViolation::ReleasedButNotCompleted {
                    booking_id: booking.id,
                    status: booking.status,
                });
            }

            let completed_releases = releases.get(&booking.id).copied().unwrap_or(0);
            let expected = usize::from(booking.escrow_released);
            if completed_releases != expected {
                report.violations.push(IntegrityViolation::ReleaseCountMismatch {
                    booking_id: booking.id,
                    escrow_released: booking.escrow_released,
                    completed_releases,
                });
            }
        }

        for wallet in wallets {
            let released_total = released_by_provider
                .get(wallet.provider_id.as_str())
                .copied()
                .unwrap_or(Decimal::ZERO);
            if released_total != wallet.balance {
                report.violations.push(IntegrityViolation::WalletBalanceMismatch {
                    provider_id: wallet.provider_id.clone(),
                    wallet_balance: wallet.balance,
                    released_total,
                });
            }
        }

        if report.is_clean() {
            info!(bookings = report.bookings_checked, "Ledger integrity verified");
        } else {
            warn!(
                bookings = report.bookings_checked,
                violations = report.violations.len(),
                "Ledger integrity violations found"
            );
        }

        report
    }
}
