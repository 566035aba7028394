//! Node runtime
//!
//! A node owns:
//! - The transport server, with the authorization pipeline as its middleware
//! - The channel service (write path and local reads)
//! - The registry of outbound peer links
//! - The fan-out query engine
//!
//! Per inbound socket it serves `login` and `getChannelData`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use skein_core::{
    AuthToken, ChannelName, FederatedEntry, LoginRequest, NodeName, PeerKey, ReadRecord,
    SkeinError, SkeinResult, SubscriptionIntent, GET_CHANNEL_DATA_PROCEDURE, LOGIN_PROCEDURE,
    LOGIN_SUCCESS,
};
use skein_store::{ChannelStore, CredentialFile, CredentialStore, FileChannelStore, StaticCredentials};
use skein_transport::{Exchange, Middleware, Request, Server, ServerEvent, Socket};

use crate::channel::blocking;
use crate::query::serve_channel_data;
use crate::{
    AuthorizationPipeline, ChannelService, ConnectionRegistry, CredentialSource, FederationQuery,
    NodeConfig, PeerConnection,
};

pub struct Node {
    config: NodeConfig,
    channels: Arc<ChannelService>,
    pipeline: Arc<AuthorizationPipeline>,
    registry: Arc<ConnectionRegistry>,
    server: Arc<Server>,
    query: FederationQuery,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Start a node backed by the stores named in `config`
    pub async fn open(config: NodeConfig) -> SkeinResult<Arc<Self>> {
        let store = FileChannelStore::open(&config.data_dir, &config.name)?;
        let credentials: Arc<dyn CredentialStore> = match &config.credentials {
            CredentialSource::File(path) => Arc::new(CredentialFile::new(path)),
            CredentialSource::Inline(list) => Arc::new(StaticCredentials::new(list.clone())),
        };
        Self::start(config, Arc::new(store), credentials).await
    }

    /// Bind the transport and start serving
    pub async fn start(
        config: NodeConfig,
        store: Arc<dyn ChannelStore>,
        credentials: Arc<dyn CredentialStore>,
    ) -> SkeinResult<Arc<Self>> {
        config.validate()?;

        let exchange = Exchange::new(config.exchange_capacity);
        let channels = Arc::new(ChannelService::new(config.name.clone(), store, exchange.clone()));
        let pipeline = Arc::new(AuthorizationPipeline::new(
            config.name.clone(),
            Arc::clone(&channels),
            config.originator_warn_threshold,
        ));
        let middleware: Arc<dyn Middleware> = Arc::clone(&pipeline) as Arc<dyn Middleware>;
        let server = Server::bind(config.transport_addr(), middleware, exchange).await?;
        let registry = Arc::new(ConnectionRegistry::new());
        let query = FederationQuery::new(
            Arc::clone(&channels),
            Arc::clone(&server),
            Arc::clone(&registry),
            config.rpc_timeout,
            config.aggregate.explicit_failures,
        );

        let listener = tokio::spawn(watch_server(
            server.listener(),
            config.name.clone(),
            Arc::clone(&channels),
            credentials,
        ));
        server.start()?;

        Ok(Arc::new(Node {
            config,
            channels,
            pipeline,
            registry,
            server,
            query,
            tasks: Mutex::new(vec![listener]),
        }))
    }

    pub fn name(&self) -> &NodeName {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Address the transport is bound to
    pub fn transport_addr(&self) -> std::net::SocketAddr {
        self.server.local_addr()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Inbound sockets currently connected
    pub fn clients(&self) -> Vec<Arc<Socket>> {
        self.server.clients()
    }

    /// Persist and broadcast a write
    pub fn write(&self, channel: &ChannelName, data: Value) -> SkeinResult<()> {
        self.channels.write(channel, data)
    }

    /// This node's history of `channel`
    pub fn read(&self, channel: &ChannelName) -> SkeinResult<Vec<ReadRecord>> {
        self.channels.read(channel)
    }

    /// Fan-out read across every live peer plus this node
    pub async fn read_all(&self, channel: &ChannelName) -> Vec<FederatedEntry> {
        self.query.get_channel_data_all(channel).await
    }

    /// Open an outbound link to `key`, wait for it to authenticate and then
    /// apply `intents`.
    ///
    /// A link already registered for the same key is closed and replaced. The
    /// link is dropped from the registry when its connection closes.
    pub async fn connect_to_peer(
        &self,
        key: PeerKey,
        intents: Vec<SubscriptionIntent>,
    ) -> SkeinResult<Arc<PeerConnection>> {
        let login = LoginRequest {
            credential: self.config.peer_login.clone(),
            client_name: Some(self.config.name.clone()),
        };
        let peer = PeerConnection::connect(
            key.clone(),
            intents,
            login,
            Arc::clone(&self.channels),
            self.config.auth_timeout,
        );

        if let Some(previous) = self.registry.insert(Arc::clone(&peer)) {
            info!(peer = %key, "replacing existing peer link");
            previous.close();
        }
        tokio::spawn(forget_when_closed(Arc::clone(&self.registry), Arc::clone(&peer)));

        if let Err(e) = peer.wait_authenticated(self.config.auth_timeout).await {
            warn!(peer = %key, error = %e, "peer link not authenticated, intents not applied");
            return Err(e);
        }

        peer.apply_intents(Arc::clone(&self.pipeline), Arc::clone(&self.channels))
            .await;
        info!(peer = %key, remote = ?peer.remote_name(), intents = peer.intents().len(), "peer link ready");
        Ok(peer)
    }

    /// Stop accepting, close every link and inbound socket
    pub fn shutdown(&self) {
        self.server.shutdown();
        for peer in self.registry.snapshot() {
            peer.close();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(node = %self.config.name, "node stopped");
    }
}

async fn forget_when_closed(registry: Arc<ConnectionRegistry>, peer: Arc<PeerConnection>) {
    peer.socket().closed().await;
    if registry.remove_if_same(&peer) {
        info!(peer = %peer.key(), "peer link removed");
    }
}

async fn watch_server(
    mut events: broadcast::Receiver<ServerEvent>,
    name: NodeName,
    channels: Arc<ChannelService>,
    credentials: Arc<dyn CredentialStore>,
) {
    loop {
        match events.recv().await {
            Ok(ServerEvent::Ready { addr }) => info!(node = %name, %addr, "transport ready"),
            Ok(ServerEvent::Connection(socket)) => {
                info!(socket = socket.id(), peer = %socket.peer(), "socket connected");
                tokio::spawn(serve_login(
                    socket.procedure(LOGIN_PROCEDURE),
                    Arc::clone(&socket),
                    name.clone(),
                    Arc::clone(&credentials),
                ));
                tokio::spawn(serve_channel_data(
                    socket.procedure(GET_CHANNEL_DATA_PROCEDURE),
                    Arc::clone(&channels),
                ));
            }
            Ok(ServerEvent::Disconnection { id, peer, reason }) => {
                info!(socket = id, %peer, %reason, "socket disconnected");
            }
            Ok(ServerEvent::Error(message)) => error!(error = %message, "transport error"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "server events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn serve_login(
    mut requests: mpsc::UnboundedReceiver<Request>,
    socket: Arc<Socket>,
    name: NodeName,
    credentials: Arc<dyn CredentialStore>,
) {
    while let Some(request) = requests.recv().await {
        let data = request.data.clone();
        let store = Arc::clone(&credentials);
        match blocking(move || check_login(&data, store.as_ref())).await {
            Ok(login) => {
                let token = AuthToken {
                    username: login.credential.username,
                    client_name: login.client_name,
                    server_name: Some(name.clone()),
                };
                info!(socket = socket.id(), user = %token.username, client = ?token.client_name, "login accepted");
                match socket.set_auth_token(token) {
                    Ok(()) => request.end(Value::from(LOGIN_SUCCESS)),
                    Err(e) => request.error(e),
                }
            }
            Err(e) => {
                warn!(socket = socket.id(), error = %e, "login rejected");
                request.error(e);
            }
        }
    }
}

fn check_login(data: &Value, credentials: &dyn CredentialStore) -> SkeinResult<LoginRequest> {
    let login: LoginRequest =
        serde_json::from_value(data.clone()).map_err(|_| SkeinError::InvalidCredentials)?;
    if credentials.verify(&login.credential.username, &login.credential.password)? {
        Ok(login)
    } else {
        Err(SkeinError::InvalidCredentials)
    }
}
