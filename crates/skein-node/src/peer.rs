//! One outbound link to another node
//!
//! A link dials the remote transport, logs in as soon as the connection is
//! up, and serves `getChannelData` from the local store so the remote side
//! can pull this node's data back over the same connection. Channel intents
//! are applied by the caller once the link reports `Authenticated`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use skein_core::{
    AuthToken, ChannelName, LoginRequest, NodeName, PeerKey, SkeinError, SkeinResult,
    SubscriptionIntent, GET_CHANNEL_DATA_PROCEDURE, LOGIN_PROCEDURE,
};
use skein_transport::{Socket, SocketEvent};

use crate::query::serve_channel_data;
use crate::{AuthorizationPipeline, ChannelService};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Authenticating,
    Authenticated,
    /// Login was refused or failed; the link is not retried
    Failed,
    Closed,
}

pub struct PeerConnection {
    key: PeerKey,
    socket: Arc<Socket>,
    intents: Vec<SubscriptionIntent>,
    state: Arc<watch::Sender<PeerState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerConnection {
    /// Start dialing `key`. Returns immediately; progress is visible through
    /// [`PeerConnection::state`] and [`PeerConnection::wait_authenticated`].
    pub fn connect(
        key: PeerKey,
        intents: Vec<SubscriptionIntent>,
        login: LoginRequest,
        channels: Arc<ChannelService>,
        login_timeout: Duration,
    ) -> Arc<Self> {
        let socket = Socket::client(&key);
        let (state, _) = watch::channel(PeerState::Connecting);
        let state = Arc::new(state);

        let lifecycle = tokio::spawn(drive_lifecycle(
            key.clone(),
            Arc::clone(&socket),
            socket.listener(),
            Arc::clone(&state),
            login,
            login_timeout,
        ));
        let server = tokio::spawn(serve_channel_data(
            socket.procedure(GET_CHANNEL_DATA_PROCEDURE),
            channels,
        ));
        socket.open();

        Arc::new(PeerConnection {
            key,
            socket,
            intents,
            state,
            tasks: Mutex::new(vec![lifecycle, server]),
        })
    }

    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    pub fn intents(&self) -> &[SubscriptionIntent] {
        &self.intents
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    /// Name the remote node declared when it accepted our login
    pub fn remote_name(&self) -> Option<NodeName> {
        self.socket.auth_token().and_then(|token| token.server_name)
    }

    /// Wait for the login handshake to finish.
    ///
    /// Fails with `AuthenticationTimeout` if it takes longer than `limit`, or
    /// `PeerUnavailable` if the link failed or closed first.
    pub async fn wait_authenticated(&self, limit: Duration) -> SkeinResult<AuthToken> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(
            limit,
            rx.wait_for(|s| {
                matches!(
                    s,
                    PeerState::Authenticated | PeerState::Failed | PeerState::Closed
                )
            }),
        )
        .await;

        let state = match waited {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => PeerState::Closed,
            Err(_) => return Err(SkeinError::AuthenticationTimeout(self.key.clone())),
        };

        match state {
            PeerState::Authenticated => self
                .socket
                .auth_token()
                .ok_or_else(|| SkeinError::PeerUnavailable(self.key.clone())),
            _ => Err(SkeinError::PeerUnavailable(self.key.clone())),
        }
    }

    /// Start the publish forwarders and subscription listeners of this link
    pub async fn apply_intents(
        &self,
        pipeline: Arc<AuthorizationPipeline>,
        channels: Arc<ChannelService>,
    ) {
        for intent in &self.intents {
            if intent.is_inert() {
                debug!(peer = %self.key, channel = %intent.channel, "intent has no direction");
            }
            if intent.publish {
                let task = tokio::spawn(forward_local_writes(
                    Arc::clone(&self.socket),
                    intent.channel.clone(),
                    Arc::clone(&pipeline),
                    channels.exchange().subscribe(&intent.channel),
                ));
                self.tasks.lock().push(task);
            }
            if intent.subscribe {
                match self.socket.subscribe(&intent.channel).await {
                    Ok(stream) => {
                        let task = tokio::spawn(store_remote_writes(
                            self.key.clone(),
                            intent.channel.clone(),
                            stream,
                            Arc::clone(&channels),
                        ));
                        self.tasks.lock().push(task);
                    }
                    Err(e) => {
                        warn!(peer = %self.key, channel = %intent.channel, error = %e, "subscription failed");
                    }
                }
            }
        }
    }

    /// Close the link and stop its tasks
    pub fn close(&self) {
        self.socket.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.state.send_replace(PeerState::Closed);
    }
}

async fn drive_lifecycle(
    key: PeerKey,
    socket: Arc<Socket>,
    mut events: broadcast::Receiver<SocketEvent>,
    state: Arc<watch::Sender<PeerState>>,
    login: LoginRequest,
    login_timeout: Duration,
) {
    loop {
        match events.recv().await {
            Ok(SocketEvent::Connect) => {
                info!(peer = %key, "peer link connected");
                state.send_replace(PeerState::Authenticating);
                let socket = Arc::clone(&socket);
                let state = Arc::clone(&state);
                let key = key.clone();
                let login = login.clone();
                tokio::spawn(async move {
                    match log_in(&socket, &login, login_timeout).await {
                        Ok(token) => {
                            info!(peer = %key, remote = ?token.server_name, "peer link authenticated");
                            state.send_replace(PeerState::Authenticated);
                        }
                        Err(e) => {
                            error!(peer = %key, error = %e, "peer login failed");
                            state.send_if_modified(|s| {
                                let changed = *s != PeerState::Closed;
                                if changed {
                                    *s = PeerState::Failed;
                                }
                                changed
                            });
                        }
                    }
                });
            }
            Ok(SocketEvent::Authenticate(_)) => {}
            Ok(SocketEvent::Error(message)) => error!(peer = %key, error = %message, "peer link error"),
            Ok(SocketEvent::Close { reason }) => {
                info!(peer = %key, %reason, "peer link closed");
                state.send_replace(PeerState::Closed);
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(peer = %key, skipped, "peer events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Invoke `login` and wait for the token the server attaches in response
async fn log_in(socket: &Socket, login: &LoginRequest, limit: Duration) -> SkeinResult<AuthToken> {
    let data = serde_json::to_value(login)?;
    let (_, token) = tokio::try_join!(
        socket.invoke(LOGIN_PROCEDURE, data, Some(limit)),
        socket.authenticated(),
    )?;
    Ok(token)
}

async fn forward_local_writes(
    socket: Arc<Socket>,
    channel: ChannelName,
    pipeline: Arc<AuthorizationPipeline>,
    mut writes: broadcast::Receiver<serde_json::Value>,
) {
    loop {
        let data = tokio::select! {
            received = writes.recv() => match received {
                Ok(data) => data,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(peer = %socket.peer(), %channel, skipped, "publish forwarder lagging");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = socket.closed() => break,
        };

        let destination = socket.auth_token().and_then(|token| token.server_name);
        if let Some(tagged) = pipeline.admit(destination.as_ref(), data) {
            if let Err(e) = socket.publish(&channel, tagged) {
                debug!(peer = %socket.peer(), %channel, error = %e, "publish forwarder stopped");
                break;
            }
        }
    }
}

async fn store_remote_writes(
    key: PeerKey,
    channel: ChannelName,
    mut stream: tokio::sync::mpsc::UnboundedReceiver<serde_json::Value>,
    channels: Arc<ChannelService>,
) {
    while let Some(data) = stream.recv().await {
        if let Err(e) = channels.write(&channel, data) {
            warn!(peer = %key, %channel, error = %e, "remote write not stored");
        }
    }
    debug!(peer = %key, %channel, "subscription ended");
}
