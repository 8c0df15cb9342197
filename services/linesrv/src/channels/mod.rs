//! Peer channels built on `ConnectionManager`
//!
//! - `plc`: product counts and start commands in, validation results and
//!   acknowledgments out
//! - `upper`: program commands out, batch results in through a single drain
//!   task

pub mod plc;
pub mod upper;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

pub use plc::{PlcChannel, PlcEvent};
pub use upper::{ResultSink, UpperChannel};

/// Outbound `{"type": ..., "data": ...}` envelope
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub data: T,
}

/// Typed fan-out to any number of subscribers
///
/// Every subscriber owns its own unbounded queue, so a slow or failed
/// consumer never holds back the others. Closed subscribers are pruned on
/// the next publish.
#[derive(Debug)]
pub struct EventBus<T: Clone> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber, returning how many received it
    pub fn publish(&self, event: T) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(7u32), 2);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let mut live = bus.subscribe();
        drop(bus.subscribe());

        assert_eq!(bus.publish("x".to_string()), 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(live.recv().await.as_deref(), Some("x"));
    }

    #[test]
    fn test_envelope_shape() {
        let json = serde_json::to_value(Envelope {
            kind: "barcode_verified",
            data: serde_json::json!({"status": "ok"}),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "barcode_verified", "data": {"status": "ok"}}));
    }
}
