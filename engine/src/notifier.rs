//! Post-commit settlement notifications.

use chrono::{DateTime, Utc};
use escrowsettle_common::{
    Booking, BookingId, ClientId, Currency, Dispute, ProviderId, ReleaseReason,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Kind of settlement event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    PaymentReleased,
    DisputeCreated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PaymentReleased => "PAYMENT_RELEASED",
            EventType::DisputeCreated => "DISPUTE_CREATED",
        }
    }
}

/// Party an event is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recipient {
    Client(ClientId),
    Provider(ProviderId),
}

/// Event emitted after a settlement unit committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub booking_id: BookingId,
    pub event_type: EventType,
    pub client_id: ClientId,
    pub provider_id: ProviderId,
    /// Amount credited to the provider, for payment events.
    pub amount: Option<Decimal>,
    pub currency: Currency,
    pub release_reason: Option<ReleaseReason>,
    pub recipients: Vec<Recipient>,
    pub timestamp: DateTime<Utc>,
}

impl SettlementEvent {
    /// Payment released to the provider; both parties are told.
    pub fn payment_released(
        booking: &Booking,
        amount: Decimal,
        reason: ReleaseReason,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            booking_id: booking.id,
            event_type: EventType::PaymentReleased,
            client_id: booking.client_id.clone(),
            provider_id: booking.provider_id.clone(),
            amount: Some(amount),
            currency: booking.currency.clone(),
            release_reason: Some(reason),
            recipients: vec![
                Recipient::Provider(booking.provider_id.clone()),
                Recipient::Client(booking.client_id.clone()),
            ],
            timestamp,
        }
    }

    /// Dispute opened by the client; both parties are told.
    pub fn dispute_created(booking: &Booking, dispute: &Dispute) -> Self {
        Self {
            booking_id: booking.id,
            event_type: EventType::DisputeCreated,
            client_id: booking.client_id.clone(),
            provider_id: booking.provider_id.clone(),
            amount: None,
            currency: booking.currency.clone(),
            release_reason: None,
            recipients: vec![
                Recipient::Provider(booking.provider_id.clone()),
                Recipient::Client(booking.client_id.clone()),
            ],
            timestamp: dispute.created_at,
        }
    }
}

/// Notification delivery failure.
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("Notification channel closed")]
    ChannelClosed,

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Delivers settlement events. Called only after the unit committed; a
/// failure here never undoes the settlement.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: SettlementEvent) -> Result<(), NotifierError>;
}

/// Notifier that writes events to the log.
pub struct TracingNotifier;

#[async_trait::async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: SettlementEvent) -> Result<(), NotifierError> {
        match event.event_type {
            EventType::PaymentReleased => {
                tracing::info!(
                    booking_id = %event.booking_id,
                    provider_id = %event.provider_id,
                    amount = ?event.amount,
                    currency = %event.currency,
                    reason = ?event.release_reason,
                    "Payment released"
                );
            }
            EventType::DisputeCreated => {
                tracing::info!(
                    booking_id = %event.booking_id,
                    provider_id = %event.provider_id,
                    client_id = %event.client_id,
                    "Dispute created"
                );
            }
        }
        Ok(())
    }
}

/// Notifier forwarding events into a channel.
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<SettlementEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SettlementEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait::async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: SettlementEvent) -> Result<(), NotifierError> {
        self.sender
            .send(event)
            .map_err(|_| NotifierError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use escrowsettle_common::{Money, UserType};
    use rust_decimal_macros::dec;

    fn booking() -> Booking {
        Booking::new(
            ClientId::new("client_1"),
            ProviderId::new("provider_1"),
            Money::new(dec!(100), Currency::usd()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::new();
        let booking = booking();

        notifier
            .notify(SettlementEvent::payment_released(
                &booking,
                dec!(95),
                ReleaseReason::ClientAccepted,
                Utc::now(),
            ))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::PaymentReleased);
        assert_eq!(event.amount, Some(dec!(95)));
        assert_eq!(event.recipients.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_channel_fails() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);

        let booking = booking();
        let dispute = Dispute::open(booking.id, "client_1", UserType::Client, "late", Utc::now());
        let result = notifier
            .notify(SettlementEvent::dispute_created(&booking, &dispute))
            .await;
        assert!(matches!(result, Err(NotifierError::ChannelClosed)));
    }

    #[test]
    fn test_event_serialization() {
        let booking = booking();
        let event =
            SettlementEvent::payment_released(&booking, dec!(95), ReleaseReason::ClientAccepted, Utc::now());
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event_type"], "PAYMENT_RELEASED");
        assert_eq!(json["recipients"][0]["type"], "PROVIDER");
    }
}
