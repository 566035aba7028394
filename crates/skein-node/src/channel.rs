//! Channel write and read paths
//!
//! Every accepted write (gateway, inbound publish, peer subscription) goes
//! through [`ChannelService::write`], which persists the raw payload and then
//! republishes the untouched envelope on the exchange.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use skein_core::{
    ChannelName, ChannelRecord, ChannelSnapshot, NodeName, ReadRecord, SkeinError, SkeinResult,
    RAW_DATA_FIELD,
};
use skein_store::ChannelStore;
use skein_transport::Exchange;

pub struct ChannelService {
    name: NodeName,
    store: Arc<dyn ChannelStore>,
    exchange: Exchange,
}

impl ChannelService {
    pub fn new(name: NodeName, store: Arc<dyn ChannelStore>, exchange: Exchange) -> Self {
        Self {
            name,
            store,
            exchange,
        }
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// Persist `data` to `channel` and publish it to local subscribers.
    ///
    /// Nothing is published if the append fails.
    pub fn write(&self, channel: &ChannelName, data: Value) -> SkeinResult<()> {
        let raw_data = match data.get(RAW_DATA_FIELD) {
            Some(inner) if !inner.is_null() => inner,
            _ => &data,
        };
        let record = ChannelRecord::now(raw_data)?;
        self.store.append(channel, record).map_err(|e| match e {
            SkeinError::WriteFailure(_) => e,
            other => SkeinError::WriteFailure(other.to_string()),
        })?;

        let delivered = self.exchange.publish(channel, data);
        debug!(%channel, delivered, "channel write");
        Ok(())
    }

    /// Local history of `channel`; empty if it was never written
    pub fn read(&self, channel: &ChannelName) -> SkeinResult<Vec<ReadRecord>> {
        match self.store.read(channel) {
            Ok(records) => Ok(records.into_iter().map(ReadRecord::from).collect()),
            Err(SkeinError::ChannelReadMiss(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Local history tagged with this node's name, as served to peers
    pub fn snapshot(&self, channel: &ChannelName) -> SkeinResult<ChannelSnapshot> {
        Ok(ChannelSnapshot {
            server: self.name.clone(),
            data: self.read(channel)?,
        })
    }
}

/// Run store work on the blocking pool instead of a runtime worker
pub(crate) async fn blocking<T, F>(work: F) -> SkeinResult<T>
where
    F: FnOnce() -> SkeinResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SkeinError::Io(std::io::Error::other(e)))?
}
