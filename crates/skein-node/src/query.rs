//! Fan-out channel reads across the mesh

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use skein_core::{ChannelName, ChannelSnapshot, FederatedEntry, SkeinError, GET_CHANNEL_DATA_PROCEDURE};
use skein_transport::{Request, Server, Socket};

use crate::channel::blocking;
use crate::{ChannelService, ConnectionRegistry};

/// Queries every live peer, inbound and outbound, for its copy of a channel
pub struct FederationQuery {
    channels: Arc<ChannelService>,
    server: Arc<Server>,
    registry: Arc<ConnectionRegistry>,
    rpc_timeout: Duration,
    explicit_failures: bool,
}

impl FederationQuery {
    pub fn new(
        channels: Arc<ChannelService>,
        server: Arc<Server>,
        registry: Arc<ConnectionRegistry>,
        rpc_timeout: Duration,
        explicit_failures: bool,
    ) -> Self {
        Self {
            channels,
            server,
            registry,
            rpc_timeout,
            explicit_failures,
        }
    }

    /// One entry per known socket, followed by this node's own entry.
    ///
    /// Sockets that are closed, unauthenticated or fail to answer contribute
    /// an empty entry (or a failure entry when explicit failures are on).
    ///
    /// Never fails: a local read error is logged and stands in as this node's
    /// entry the same way a peer failure does.
    pub async fn get_channel_data_all(&self, channel: &ChannelName) -> Vec<FederatedEntry> {
        let mut sockets = self.server.clients();
        sockets.extend(self.registry.sockets());

        let mut branches = JoinSet::new();
        for (index, socket) in sockets.iter().enumerate() {
            let socket = Arc::clone(socket);
            let channel = channel.clone();
            let rpc_timeout = self.rpc_timeout;
            let explicit = self.explicit_failures;
            branches.spawn(async move {
                (index, query_peer(socket, channel, rpc_timeout, explicit).await)
            });
        }

        let mut entries = vec![FederatedEntry::Empty {}; sockets.len()];
        while let Some(joined) = branches.join_next().await {
            match joined {
                Ok((index, entry)) => entries[index] = entry,
                Err(e) => warn!(%channel, error = %e, "fan-out branch aborted"),
            }
        }

        entries.push(self.local_entry(channel).await);
        debug!(%channel, peers = sockets.len(), "fan-out read complete");
        entries
    }

    async fn local_entry(&self, channel: &ChannelName) -> FederatedEntry {
        let channels = Arc::clone(&self.channels);
        let target = channel.clone();
        match blocking(move || channels.snapshot(&target)).await {
            Ok(snapshot) => FederatedEntry::Data(snapshot),
            Err(e) => {
                warn!(%channel, error = %e, "local history left out of fan-out read");
                if self.explicit_failures {
                    FederatedEntry::Failed {
                        peer: self.channels.name().to_string(),
                        error: e.to_string(),
                    }
                } else {
                    FederatedEntry::Data(ChannelSnapshot {
                        server: self.channels.name().clone(),
                        data: Vec::new(),
                    })
                }
            }
        }
    }
}

async fn query_peer(
    socket: Arc<Socket>,
    channel: ChannelName,
    rpc_timeout: Duration,
    explicit: bool,
) -> FederatedEntry {
    if !socket.is_open() || !socket.is_authenticated() {
        return FederatedEntry::Empty {};
    }

    let request = Value::String(channel.as_str().to_string());
    let reason = match socket
        .invoke(GET_CHANNEL_DATA_PROCEDURE, request, Some(rpc_timeout))
        .await
    {
        Ok(reply) => match serde_json::from_value::<ChannelSnapshot>(reply) {
            Ok(snapshot) => return FederatedEntry::Data(snapshot),
            Err(e) => format!("unexpected reply: {e}"),
        },
        Err(e) => e.to_string(),
    };

    let peer = socket.peer().to_string();
    let failure = SkeinError::PeerInvocationFailure {
        peer: peer.clone(),
        reason: reason.clone(),
    };
    warn!(%channel, error = %failure, "peer left out of fan-out read");

    if explicit {
        FederatedEntry::Failed {
            peer,
            error: reason,
        }
    } else {
        FederatedEntry::Empty {}
    }
}

/// Answer `getChannelData` calls from the local store
pub(crate) async fn serve_channel_data(
    mut requests: mpsc::UnboundedReceiver<Request>,
    channels: Arc<ChannelService>,
) {
    while let Some(request) = requests.recv().await {
        let channels = Arc::clone(&channels);
        if let Err(e) = blocking(move || {
            answer_channel_data(request, &channels);
            Ok(())
        })
        .await
        {
            warn!(error = %e, "getChannelData handler failed");
        }
    }
}

fn answer_channel_data(request: Request, channels: &ChannelService) {
    let channel = match serde_json::from_value::<ChannelName>(request.data.clone()) {
        Ok(channel) => channel,
        Err(e) => {
            request.error(format!("invalid channel name: {e}"));
            return;
        }
    };

    let snapshot = channels
        .snapshot(&channel)
        .and_then(|snapshot| Ok(serde_json::to_value(snapshot)?));
    match snapshot {
        Ok(value) => request.end(value),
        Err(e) => request.error(e),
    }
}
