//! EscrowSettle Ledger
//!
//! Provider wallets, the append-only transaction journal and the integrity
//! audit over both.

pub mod audit;
pub mod error;
pub mod journal;
pub mod transaction;
pub mod wallet;

pub use audit::{IntegrityReport, IntegrityViolation, LedgerAudit};
pub use error::{LedgerError, LedgerResult};
pub use journal::TransactionJournal;
pub use transaction::{
    ReleaseMetadata, Transaction, TransactionMetadata, TransactionStatus, TransactionType,
};
pub use wallet::{upsert_credit, ProviderWallet};
