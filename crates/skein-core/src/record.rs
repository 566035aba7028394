//! Channel records and fan-out read results

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{NodeName, SkeinResult};

/// Name of the procedure that returns a node's local copy of a channel
pub const GET_CHANNEL_DATA_PROCEDURE: &str = "getChannelData";

/// Milliseconds since the Unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Timestamp(millis)
    }

    #[inline]
    pub fn as_millis(self) -> i64 {
        self.0
    }
}

/// One persisted entry of a channel log.
///
/// `data` holds the serialized raw payload; the originator set is not kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub timestamp: Timestamp,
    pub data: String,
}

impl ChannelRecord {
    /// Build a record for `raw_data` stamped with the current time
    pub fn now(raw_data: &Value) -> SkeinResult<Self> {
        Ok(Self {
            timestamp: Timestamp::now(),
            data: serde_json::to_string(raw_data)?,
        })
    }

    /// Parse the stored payload back into JSON
    pub fn value(&self) -> SkeinResult<Value> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// A record as returned to readers: `{date, value}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRecord {
    pub date: Timestamp,
    pub value: String,
}

impl From<ChannelRecord> for ReadRecord {
    fn from(record: ChannelRecord) -> Self {
        ReadRecord {
            date: record.timestamp,
            value: record.data,
        }
    }
}

/// One node's copy of a channel, as answered by `getChannelData`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub server: NodeName,
    pub data: Vec<ReadRecord>,
}

/// One entry of a fan-out read.
///
/// Unreachable or failing peers contribute `Empty` (`{}` on the wire) unless
/// explicit failures are enabled, in which case they contribute `Failed`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FederatedEntry {
    Data(ChannelSnapshot),
    Failed { peer: String, error: String },
    Empty {},
}

impl FederatedEntry {
    pub fn server(&self) -> Option<&NodeName> {
        match self {
            FederatedEntry::Data(snapshot) => Some(&snapshot.server),
            _ => None,
        }
    }

    pub fn records(&self) -> &[ReadRecord] {
        match self {
            FederatedEntry::Data(snapshot) => &snapshot.data,
            _ => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FederatedEntry::Empty {})
    }
}
