//! In-process channel exchange
//!
//! Publishing to a channel with no subscribers drops the message.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

use skein_core::ChannelName;

/// Default per-channel buffer for slow subscribers
pub const DEFAULT_EXCHANGE_CAPACITY: usize = 1024;

/// Named-channel broadcast shared by a server and its local publishers
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

struct ExchangeInner {
    capacity: usize,
    channels: RwLock<HashMap<ChannelName, broadcast::Sender<Value>>>,
}

impl Exchange {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ExchangeInner {
                capacity: capacity.max(1),
                channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Deliver `data` to every current subscriber of `channel`.
    /// Returns how many subscribers received it.
    pub fn publish(&self, channel: &ChannelName, data: Value) -> usize {
        match self.inner.channels.read().get(channel) {
            Some(tx) => tx.send(data).unwrap_or(0),
            None => 0,
        }
    }

    pub fn subscribe(&self, channel: &ChannelName) -> broadcast::Receiver<Value> {
        if let Some(tx) = self.inner.channels.read().get(channel) {
            return tx.subscribe();
        }
        self.inner
            .channels
            .write()
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, channel: &ChannelName) -> usize {
        self.inner
            .channels
            .read()
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new(DEFAULT_EXCHANGE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let exchange = Exchange::default();
        assert_eq!(exchange.publish(&"sensors".into(), json!(1)), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let exchange = Exchange::new(8);
        let channel = ChannelName::from("sensors");
        let mut a = exchange.subscribe(&channel);
        let mut b = exchange.subscribe(&channel);

        assert_eq!(exchange.subscriber_count(&channel), 2);
        assert_eq!(exchange.publish(&channel, json!({"temp": 72})), 2);
        assert_eq!(a.recv().await.unwrap(), json!({"temp": 72}));
        assert_eq!(b.recv().await.unwrap(), json!({"temp": 72}));
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let exchange = Exchange::default();
        let mut other = exchange.subscribe(&"other".into());
        let _sensors = exchange.subscribe(&"sensors".into());

        exchange.publish(&"sensors".into(), json!(1));
        assert!(other.try_recv().is_err());
    }
}
