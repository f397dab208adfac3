//! Dispute gate.
//!
//! Any dispute row blocks settlement, whatever its status. Release of a
//! disputed booking is left to the dispute resolution flow.

use std::sync::Arc;

use escrowsettle_common::{BookingId, Dispute, Result};

use crate::store::SettlementStore;

/// Whether `dispute` blocks settlement of its booking.
pub fn blocks_settlement(dispute: Option<&Dispute>) -> bool {
    dispute.is_some()
}

/// Read-side dispute check used before entering a settlement unit.
///
/// The stores re-evaluate the same rule inside the unit, so a dispute racing
/// in after this check still wins.
#[derive(Clone)]
pub struct DisputeGate {
    store: Arc<dyn SettlementStore>,
}

impl DisputeGate {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    pub async fn has_open_dispute(&self, booking_id: BookingId) -> Result<bool> {
        let dispute = self.store.get_dispute(booking_id).await?;
        Ok(blocks_settlement(dispute.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use escrowsettle_common::{DisputeStatus, UserType};

    #[test]
    fn test_resolved_dispute_still_blocks() {
        let mut dispute = Dispute::open(BookingId::new(), "client_1", UserType::Client, "late", Utc::now());
        assert!(blocks_settlement(Some(&dispute)));

        dispute.status = DisputeStatus::Resolved;
        assert!(blocks_settlement(Some(&dispute)));
        assert!(!blocks_settlement(None));
    }

    #[tokio::test]
    async fn test_gate_reads_store() {
        let store = Arc::new(MemoryStore::new());
        let gate = DisputeGate::new(store.clone());
        let booking_id = BookingId::new();

        assert!(!gate.has_open_dispute(booking_id).await.unwrap());

        store.insert_dispute(Dispute::open(booking_id, "client_1", UserType::Client, "late", Utc::now()));
        assert!(gate.has_open_dispute(booking_id).await.unwrap());
    }
}
