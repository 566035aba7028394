//! Per-link subscription intents

use serde::{Deserialize, Serialize};

use crate::ChannelName;

/// What a peer link does with one channel.
///
/// `publish` forwards locally produced writes to the peer; `subscribe` listens
/// to the peer's stream and persists what arrives. Supplied once when the link
/// is created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionIntent {
    pub channel: ChannelName,
    #[serde(default)]
    pub publish: bool,
    #[serde(default)]
    pub subscribe: bool,
}

impl SubscriptionIntent {
    pub fn new(channel: impl Into<ChannelName>) -> Self {
        Self {
            channel: channel.into(),
            publish: false,
            subscribe: false,
        }
    }

    pub fn publish(mut self) -> Self {
        self.publish = true;
        self
    }

    pub fn subscribe(mut self) -> Self {
        self.subscribe = true;
        self
    }

    /// Neither direction requested
    pub fn is_inert(&self) -> bool {
        !self.publish && !self.subscribe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_flags_default_false() {
        let intent: SubscriptionIntent = serde_json::from_str(r#"{"channel":"sensors"}"#).unwrap();
        assert_eq!(intent.channel, ChannelName::from("sensors"));
        assert!(intent.is_inert());
    }

    #[test]
    fn test_intent_builder() {
        let intent = SubscriptionIntent::new("sensors").subscribe();
        assert!(intent.subscribe);
        assert!(!intent.publish);
    }
}
