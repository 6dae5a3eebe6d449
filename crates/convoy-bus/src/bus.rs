//! Named-channel publish/subscribe.
//!
//! One broadcast channel per name, created on first use. Publishing is
//! best-effort and never blocks the producer: no subscribers means the
//! event is dropped, and a slow subscriber lags rather than stalling the
//! token loop. No durability across restarts; consumers are idempotent by
//! `sequence`.

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use crate::event::BusEvent;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
pub struct StreamBus {
    channels: DashMap<String, broadcast::Sender<BusEvent>>,
}

impl StreamBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<BusEvent> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Deliver to current subscribers. Returns the receiver count.
    pub fn publish(&self, channel: &str, event: BusEvent) -> usize {
        let sender = self.sender(channel);
        match sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                trace!(channel, "published event with no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusEvent> {
        self.sender(channel).subscribe()
    }
}

pub fn chat_stream_channel(chat_id: &str) -> String {
    format!("chat_stream::{chat_id}")
}

pub fn typing_events_channel(user_id_hash: &str) -> String {
    format!("ai_typing_indicator_events::{user_id_hash}")
}

pub fn message_persisted_channel(user_id_hash: &str) -> String {
    format!("ai_message_persisted::{user_id_hash}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChunkEvent;

    fn chunk(seq: u64) -> BusEvent {
        BusEvent::AiMessageChunk(ChunkEvent {
            sequence: seq,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = StreamBus::new();
        let channel = chat_stream_channel("c1");
        let mut rx = bus.subscribe(&channel);

        bus.publish(&channel, chunk(1));
        bus.publish(&channel, chunk(2));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (BusEvent::AiMessageChunk(a), BusEvent::AiMessageChunk(b)) => {
                assert_eq!(a.sequence, 1);
                assert_eq!(b.sequence, 2);
            }
            _ => panic!("unexpected event kinds"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = StreamBus::new();
        assert_eq!(bus.publish("nobody", chunk(1)), 0);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = StreamBus::new();
        let mut rx_a = bus.subscribe("a");
        let _rx_b = bus.subscribe("b");

        bus.publish("b", chunk(7));
        bus.publish("a", chunk(9));

        match rx_a.recv().await.unwrap() {
            BusEvent::AiMessageChunk(c) => assert_eq!(c.sequence, 9),
            _ => panic!("unexpected event"),
        }
    }
}
