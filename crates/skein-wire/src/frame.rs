//! Frame structure for the skein peer protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

use skein_core::{AuthToken, ChannelName};

/// Correlates an `Invoke` with its `Reply`
pub type CallId = u64;

/// Result of a remote procedure
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(Value),
    Err(String),
}

impl Outcome {
    pub fn into_result(self) -> Result<Value, String> {
        match self {
            Outcome::Ok(value) => Ok(value),
            Outcome::Err(message) => Err(message),
        }
    }
}

/// One unit of traffic on a peer connection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Call a named procedure on the other side
    Invoke {
        id: CallId,
        procedure: String,
        #[serde(default)]
        data: Value,
    },
    /// Answer to an `Invoke`
    Reply { id: CallId, outcome: Outcome },
    /// Client asks to receive a channel's stream
    Subscribe { channel: ChannelName },
    /// Server accepted a `Subscribe`
    Subscribed { channel: ChannelName },
    /// Server refused a `Subscribe`
    SubscribeFail { channel: ChannelName, error: String },
    Unsubscribe { channel: ChannelName },
    /// Client to server: publish in. Server to client: publish out.
    Publish {
        channel: ChannelName,
        #[serde(default)]
        data: Value,
    },
    /// Raw named event outside any channel
    Transmit {
        event: String,
        #[serde(default)]
        data: Value,
    },
    /// Server attached a token to the connection
    Authenticated { token: AuthToken },
}

impl Frame {
    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Invoke { .. } => "invoke",
            Frame::Reply { .. } => "reply",
            Frame::Subscribe { .. } => "subscribe",
            Frame::Subscribed { .. } => "subscribed",
            Frame::SubscribeFail { .. } => "subscribe_fail",
            Frame::Unsubscribe { .. } => "unsubscribe",
            Frame::Publish { .. } => "publish",
            Frame::Transmit { .. } => "transmit",
            Frame::Authenticated { .. } => "authenticated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_is_tagged_by_kind() {
        let frame = Frame::Publish {
            channel: ChannelName::from("sensors"),
            data: json!({"temp": 72}),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["kind"], "publish");
        assert_eq!(value["channel"], "sensors");
    }

    #[test]
    fn test_reply_outcome_shape() {
        let frame = Frame::Reply {
            id: 7,
            outcome: Outcome::Err("Invalid credentials".into()),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["outcome"], json!({"err": "Invalid credentials"}));
        assert_eq!(frame.kind(), "reply");
    }

    #[test]
    fn test_invoke_data_defaults_to_null() {
        let frame: Frame = serde_json::from_value(json!({"kind": "invoke", "id": 1, "procedure": "ping"})).unwrap();
        assert_eq!(
            frame,
            Frame::Invoke {
                id: 1,
                procedure: "ping".into(),
                data: Value::Null,
            }
        );
    }
}
