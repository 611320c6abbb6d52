//! Event producer: hands structured records to the telemetry consumer.

use flock_core::Event;
use tokio::sync::mpsc;

/// Cheap to clone; a producer without a consumer drops records.
#[derive(Debug, Clone)]
pub struct EventProducer {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventProducer {
    /// Producer plus the receiving end for the consumer.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: Event) {
        tracing::trace!(event = event.name(), record = %to_json(&event), "event");
        if let Some(tx) = &self.tx {
            // Consumer gone: records are dropped.
            let _ = tx.send(event);
        }
    }
}

/// The record as one line of JSON, the form the telemetry consumer ships.
pub fn to_json(event: &Event) -> String {
    serde_json::to_string(event)
        .unwrap_or_else(|e| format!(r#"{{"event":"{}","error":"{}"}}"#, event.name(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_core::{ContentHash, PeerId};

    #[test]
    fn channel_delivers_in_order() {
        let (events, mut rx) = EventProducer::channel();
        let hash = ContentHash::of(b"a");
        events.emit(Event::SwarmCompleted { hash });
        events.emit(Event::TrashSwept { hash });
        assert_eq!(rx.try_recv().unwrap(), Event::SwarmCompleted { hash });
        assert_eq!(rx.try_recv().unwrap(), Event::TrashSwept { hash });
    }

    #[test]
    fn noop_and_closed_consumer_do_not_fail() {
        EventProducer::noop().emit(Event::SwarmCompleted {
            hash: ContentHash::of(b"a"),
        });
        let (events, rx) = EventProducer::channel();
        drop(rx);
        events.emit(Event::SwarmCompleted {
            hash: ContentHash::of(b"a"),
        });
    }

    #[test]
    fn records_are_flat_json_with_hex_ids() {
        let hash = ContentHash::of(b"a");
        let peer = PeerId::generate();
        let json: serde_json::Value = serde_json::from_str(&to_json(&Event::PieceReceived {
            hash,
            peer,
            index: 7,
        }))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "event": "piece_received",
                "hash": hash.to_hex(),
                "peer": peer.to_string(),
                "index": 7,
            })
        );

        let json: serde_json::Value = serde_json::from_str(&to_json(&Event::HandshakeRejected {
            hash: None,
            peer: Some(peer),
            reason: "bad magic".into(),
        }))
        .unwrap();
        assert_eq!(json["event"], "handshake_rejected");
        assert!(json["hash"].is_null());
        assert_eq!(json["peer"], peer.to_string());
    }
}
