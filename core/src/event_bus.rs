//! Event Bus
//!
//! Single-process pub/sub fanning state changes out to subscribed
//! consumers. Built on `tokio::sync::broadcast`, which gives the bus its
//! required shape for free: `send` never blocks on a slow subscriber, and a
//! subscriber that falls behind is lagged (effectively dropped from the
//! active set) rather than stalling the producer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionAccount {
    pub phone_number: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastDisconnect {
    pub reason: String,
    pub code: i32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: String,
    pub uptime_secs: u64,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_disconnect: Option<LastDisconnect>,
    pub reconnect_attempts: u32,
    pub account: Option<ConnectionAccount>,
}

/// `IntentStatus{sent|failed|delivered}` from the design.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentStatusEvent {
    pub intent_id: String,
    pub status: String,
    pub at: DateTime<Utc>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitWarning {
    pub sent_today: u32,
    pub daily_cap: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitReached {
    pub sent_today: u32,
    pub daily_cap: u32,
    pub reset_at: DateTime<Utc>,
}

/// The tagged union of everything the core publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    PairingCode { code: String, rendered_for_cli: String, data_url: String },
    ConnectionStatus(ConnectionStatus),
    IntentStatus(IntentStatusEvent),
    RateLimitWarning(RateLimitWarning),
    RateLimitReached(RateLimitReached),
}

/// Owns the broadcast channel. Cloned cheaply (it wraps a `Sender`), so
/// every producer can hold its own handle.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Register a new consumer. Dropping the receiver unsubscribes it.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Best-effort publish: if there are no subscribers this is a no-op,
    /// never an error the producer needs to handle.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::RateLimitReached(RateLimitReached {
            sent_today: 30,
            daily_cap: 30,
            reset_at: Utc::now(),
        }));

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::RateLimitReached(_)));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::PairingCode {
            code: "ABC".into(),
            rendered_for_cli: "ABC".into(),
            data_url: "data:text/plain;base64,QUJD".into(),
        });
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking_producer() {
        let bus = EventBus::new();
        let _rx_unused = bus.subscribe();

        for i in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish(Event::IntentStatus(IntentStatusEvent {
                intent_id: format!("intent-{i}"),
                status: "sent".into(),
                at: Utc::now(),
                failure_reason: None,
            }));
        }
    }
}
