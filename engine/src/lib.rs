//! EscrowSettle Engine
//!
//! Releases escrowed booking payments to providers. A release happens either
//! when the client accepts the finished work or when the client confirmation
//! window lapses without a response. Each release is one atomic unit: booking
//! update, ledger row and wallet credit commit together or not at all.

pub mod config;
pub mod dispute_gate;
pub mod metrics;
pub mod notifier;
pub mod scheduler;
pub mod service;
pub mod settlement_engine;
pub mod store;

pub use config::{AutoReleaseConfig, EngineConfig};
pub use dispute_gate::DisputeGate;
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use notifier::{ChannelNotifier, EventType, Notifier, NotifierError, SettlementEvent, TracingNotifier};
pub use scheduler::{AutoReleaseFailure, AutoReleaseScheduler, AutoReleaseSummary};
pub use service::{ClientAction, ConfirmCompletionRequest, ConfirmCompletionResponse, EscrowService};
pub use settlement_engine::{ReleaseOutcome, ReleaseReceipt, SettlementEngine};
pub use store::{AutoReleaseHold, MemoryStore, PgStore, SettlementStore};
