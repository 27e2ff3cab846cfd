//! Post-commit collaborators: payment-link generation and player
//! notification. Both gateways are mocked; failures never undo a booking.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::model::{format_hhmm, Booking, Player};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("rejected by gateway: {0}")]
    Rejected(String),
    #[error("timed out after {0} ms")]
    TimedOut(u128),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payment link the player can use to pay for `booking`.
    async fn create_payment_link(&self, booking: &Booking) -> Result<String, DispatchError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_player(&self, player: &Player, booking: &Booking) -> Result<(), DispatchError>;
}

/// Links of the form `{base_url}/pay/{booking_id}?amount={total}`.
pub struct MockPaymentGateway {
    base_url: String,
}

impl MockPaymentGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_payment_link(&self, booking: &Booking) -> Result<String, DispatchError> {
        Ok(format!(
            "{}/pay/{}?amount={}",
            self.base_url, booking.id, booking.total_amount
        ))
    }
}

/// Writes the SMS that would have been sent to the log.
pub struct LogNotifier;

/// SMS payload for a new booking.
pub fn booking_message(player: &Player, booking: &Booking) -> serde_json::Value {
    json!({
        "to": player.mobile,
        "template": "booking_created",
        "params": {
            "name": player.name,
            "booking_id": booking.id.to_string(),
            "date": booking.booking_date.to_string(),
            "start_time": format_hhmm(booking.span.start),
            "end_time": format_hhmm(booking.span.end),
            "amount": booking.total_amount.to_string(),
        },
    })
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_player(&self, player: &Player, booking: &Booking) -> Result<(), DispatchError> {
        info!(target: "courtside::sms", "{}", booking_message(player, booking));
        Ok(())
    }
}

/// The set of collaborators an engine dispatches to after each commit.
#[derive(Clone)]
pub struct Dispatch {
    pub payments: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
}

impl Dispatch {
    pub fn mock(payment_base_url: &str) -> Self {
        Self {
            payments: Arc::new(MockPaymentGateway::new(payment_base_url)),
            notifier: Arc::new(LogNotifier),
        }
    }
}

impl Default for Dispatch {
    fn default() -> Self {
        Self::mock("https://pay.example.invalid")
    }
}
