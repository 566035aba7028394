//! Message envelopes and originator tagging
//!
//! Every write that crosses a node boundary travels as an envelope carrying the
//! set of node names that have already processed it:
//!
//! ```text
//! { "originators": { "<node>": 1, ... }, "raw_data": <payload> }
//! ```
//!
//! A payload without that shape (the first hop from an external writer) is a
//! `Raw` envelope. Tagging wraps it; the set only ever grows. A node refuses
//! to forward an envelope to a peer whose name is already in the set, which
//! breaks replay loops in arbitrary (cyclic) topologies.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::NodeName;

/// Wire field holding the visited-node set
pub const ORIGINATORS_FIELD: &str = "originators";

/// Wire field holding the wrapped payload
pub const RAW_DATA_FIELD: &str = "raw_data";

/// Presence marker stored against each originator on the wire
const PRESENT: u8 = 1;

/// A payload as it flows through the mesh
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// Untagged payload, not yet seen by any node
    Raw(Value),
    /// Payload plus the set of nodes that have processed it
    Tagged {
        originators: BTreeSet<NodeName>,
        raw_data: Value,
    },
}

impl Envelope {
    /// Classify a JSON value.
    ///
    /// An object is an envelope when it carries an `originators` object or a
    /// `raw_data` field; `{raw_data: X}` written by a client is therefore an
    /// envelope with an empty originator set.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut map) if is_envelope_shape(&map) => {
                let originators = match map.remove(ORIGINATORS_FIELD) {
                    Some(Value::Object(set)) => set.into_iter().map(|(k, _)| NodeName::from(k)).collect(),
                    _ => BTreeSet::new(),
                };
                let raw_data = map.remove(RAW_DATA_FIELD).unwrap_or(Value::Null);
                Envelope::Tagged {
                    originators,
                    raw_data,
                }
            }
            other => Envelope::Raw(other),
        }
    }

    /// Convert back to the wire shape
    pub fn into_value(self) -> Value {
        match self {
            Envelope::Raw(value) => value,
            Envelope::Tagged {
                originators,
                raw_data,
            } => {
                let set: Map<String, Value> = originators
                    .into_iter()
                    .map(|name| (name.as_str().to_string(), Value::from(PRESENT)))
                    .collect();
                let mut map = Map::new();
                map.insert(ORIGINATORS_FIELD.to_string(), Value::Object(set));
                map.insert(RAW_DATA_FIELD.to_string(), raw_data);
                Value::Object(map)
            }
        }
    }

    /// The payload with any envelope stripped
    pub fn raw_data(&self) -> &Value {
        match self {
            Envelope::Raw(value) => value,
            Envelope::Tagged { raw_data, .. } => raw_data,
        }
    }

    pub fn into_raw_data(self) -> Value {
        match self {
            Envelope::Raw(value) => value,
            Envelope::Tagged { raw_data, .. } => raw_data,
        }
    }

    /// Nodes that have processed this envelope, in name order
    pub fn originators(&self) -> impl Iterator<Item = &NodeName> {
        let set = match self {
            Envelope::Raw(_) => None,
            Envelope::Tagged { originators, .. } => Some(originators),
        };
        set.into_iter().flatten()
    }

    pub fn originator_count(&self) -> usize {
        match self {
            Envelope::Raw(_) => 0,
            Envelope::Tagged { originators, .. } => originators.len(),
        }
    }

    pub fn is_tagged(&self) -> bool {
        matches!(self, Envelope::Tagged { .. })
    }
}

fn is_envelope_shape(map: &Map<String, Value>) -> bool {
    matches!(map.get(ORIGINATORS_FIELD), Some(Value::Object(_))) || map.contains_key(RAW_DATA_FIELD)
}

impl From<Value> for Envelope {
    fn from(value: Value) -> Self {
        Envelope::from_value(value)
    }
}

impl From<Envelope> for Value {
    fn from(envelope: Envelope) -> Self {
        envelope.into_value()
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.clone().into_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Envelope::from_value)
    }
}

/// Record that `name` has processed `payload`.
///
/// An empty name or an absent (null) payload is returned unchanged. Tagging
/// the same name twice is a no-op.
pub fn tag_originator(name: &NodeName, payload: Envelope) -> Envelope {
    if name.is_empty() {
        return payload;
    }
    match payload {
        Envelope::Raw(Value::Null) => Envelope::Raw(Value::Null),
        Envelope::Raw(raw_data) => Envelope::Tagged {
            originators: BTreeSet::from([name.clone()]),
            raw_data,
        },
        Envelope::Tagged {
            mut originators,
            raw_data,
        } => {
            originators.insert(name.clone());
            Envelope::Tagged {
                originators,
                raw_data,
            }
        }
    }
}

/// True iff `payload` is an envelope already carrying `name`
pub fn has_seen(name: &NodeName, payload: &Envelope) -> bool {
    match payload {
        Envelope::Raw(_) => false,
        Envelope::Tagged { originators, .. } => originators.contains(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn name(s: &str) -> NodeName {
        NodeName::from(s)
    }

    #[test]
    fn test_raw_payload_is_wrapped() {
        let tagged = tag_originator(&name("a"), Envelope::from_value(json!({"temp": 72})));
        assert_eq!(
            tagged.into_value(),
            json!({"originators": {"a": 1}, "raw_data": {"temp": 72}})
        );
    }

    #[test]
    fn test_tagged_payload_gains_name() {
        let wire = json!({"originators": {"a": 1}, "raw_data": 5});
        let tagged = tag_originator(&name("b"), Envelope::from_value(wire));
        assert!(has_seen(&name("a"), &tagged));
        assert!(has_seen(&name("b"), &tagged));
        assert_eq!(tagged.raw_data(), &json!(5));
        assert_eq!(tagged.originators().collect::<Vec<_>>(), vec![&name("a"), &name("b")]);
        assert_eq!(Envelope::from_value(json!(5)).originators().count(), 0);
    }

    #[test]
    fn test_empty_name_or_null_payload_unchanged() {
        let payload = Envelope::from_value(json!("hello"));
        assert_eq!(tag_originator(&NodeName::default(), payload.clone()), payload);

        let null = Envelope::Raw(Value::Null);
        assert_eq!(tag_originator(&name("a"), null.clone()), null);
    }

    #[test]
    fn test_has_seen_raw_is_false() {
        let payload = Envelope::from_value(json!({"temp": 72}));
        assert!(!has_seen(&name("a"), &payload));
    }

    #[test]
    fn test_raw_data_only_object_is_envelope() {
        let payload = Envelope::from_value(json!({"raw_data": [1, 2]}));
        assert!(payload.is_tagged());
        assert_eq!(payload.originator_count(), 0);
        assert_eq!(payload.raw_data(), &json!([1, 2]));
    }

    #[test]
    fn test_non_object_originators_is_plain_payload() {
        let payload = Envelope::from_value(json!({"originators": "someone"}));
        assert!(!payload.is_tagged());
    }

    #[test]
    fn test_serde_matches_wire_shape() {
        let wire = json!({"originators": {"x": 1, "y": 1}, "raw_data": {"k": "v"}});
        let envelope: Envelope = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(serde_json::to_value(&envelope).unwrap(), wire);
    }

    fn payload_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            "[a-z ]{0,16}".prop_map(Value::from),
            (any::<i32>(), "[a-z]{1,8}").prop_map(|(n, k)| {
                let mut map = Map::new();
                map.insert(k, Value::from(n));
                Value::Object(map)
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_tagging_is_idempotent(payload in payload_strategy(), n in "[a-z]{1,8}") {
            let n = NodeName::from(n);
            let once = tag_originator(&n, Envelope::from_value(payload));
            let twice = tag_originator(&n, once.clone());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_originators_count_distinct_names(
            payload in payload_strategy(),
            names in proptest::collection::vec("[a-z]{1,6}", 1..12),
        ) {
            let mut envelope = Envelope::from_value(payload);
            for n in &names {
                envelope = tag_originator(&NodeName::from(n.as_str()), envelope);
            }
            let distinct: BTreeSet<&String> = names.iter().collect();
            prop_assert_eq!(envelope.originator_count(), distinct.len());

            let mut reversed = Envelope::from_value(envelope.raw_data().clone());
            for n in names.iter().rev() {
                reversed = tag_originator(&NodeName::from(n.as_str()), reversed);
            }
            prop_assert_eq!(reversed, envelope);
        }

        #[test]
        fn prop_tagged_name_is_seen(payload in payload_strategy(), a in "[a-m]{1,6}", b in "[n-z]{1,6}") {
            let tagged = tag_originator(&NodeName::from(a.as_str()), Envelope::from_value(payload));
            prop_assert!(has_seen(&NodeName::from(a.as_str()), &tagged));
            prop_assert!(!has_seen(&NodeName::from(b.as_str()), &tagged));
        }
    }
}
