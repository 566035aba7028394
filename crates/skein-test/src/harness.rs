//! Multi-node harness
//!
//! Starts real nodes on loopback ports with in-memory stores, and scripted
//! stand-in peers built directly on the transport for behaviors a healthy
//! node never shows (refusing reads, never answering).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use skein_core::{
    AuthToken, ChannelName, ChannelRecord, ChannelSnapshot, Credential, LoginRequest, NodeName,
    PeerKey, ReadRecord, SkeinResult, SubscriptionIntent, GET_CHANNEL_DATA_PROCEDURE, LOGIN_PROCEDURE,
    LOGIN_SUCCESS,
};
use skein_node::{Node, NodeConfig};
use skein_store::{MemoryChannelStore, StaticCredentials};
use skein_transport::{AllowAll, Exchange, Request, Server, ServerEvent, Socket};

pub const TEST_USER: &str = "mesh";
pub const TEST_PASSWORD: &str = "mesh-secret";

/// Default wait for conditions that settle asynchronously
pub const SETTLE: Duration = Duration::from_secs(3);

/// Route node logs to the test writer; safe to call from every test
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn test_credential() -> Credential {
    Credential::new(TEST_USER, TEST_PASSWORD)
}

/// Loopback config with short timeouts
pub fn node_config(name: &str) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.name = NodeName::from(name);
    config.host = "127.0.0.1".into();
    config.port = 0;
    config.peer_login = test_credential();
    config.auth_timeout = Duration::from_secs(2);
    config.rpc_timeout = Duration::from_millis(400);
    config
}

pub async fn spawn_node(name: &str) -> SkeinResult<Arc<Node>> {
    spawn_node_with(node_config(name)).await
}

pub async fn spawn_node_with(config: NodeConfig) -> SkeinResult<Arc<Node>> {
    Node::start(
        config,
        Arc::new(MemoryChannelStore::new()),
        Arc::new(StaticCredentials::new(vec![test_credential()])),
    )
    .await
}

/// Key other nodes use to dial `node`
pub fn peer_key(node: &Node) -> PeerKey {
    PeerKey::new("127.0.0.1", node.transport_addr().port())
}

/// Link `from` to `to` with the given intents and wait for it to be ready
pub async fn link(from: &Node, to: &Node, intents: Vec<SubscriptionIntent>) -> SkeinResult<()> {
    from.connect_to_peer(peer_key(to), intents).await.map(|_| ())
}

/// Poll `check` until it holds or `limit` passes
pub async fn eventually<F: FnMut() -> bool>(limit: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Number of records `node` holds for `channel`
pub fn stored(node: &Node, channel: &str) -> usize {
    node.read(&ChannelName::from(channel))
        .map(|records| records.len())
        .unwrap_or(0)
}

/// Wait until `node` holds `expected` records of `channel`, then make sure
/// nothing else arrives during `quiet`
pub async fn settles_at(node: &Node, channel: &str, expected: usize, quiet: Duration) -> bool {
    if !eventually(SETTLE, || stored(node, channel) >= expected).await {
        return false;
    }
    tokio::time::sleep(quiet).await;
    stored(node, channel) == expected
}

/// A transport connection to `node` that never logs in
pub async fn raw_client(node: &Node) -> SkeinResult<Arc<Socket>> {
    Socket::connect(&peer_key(node)).await
}

/// A transport connection to `node` logged in with the test credential
pub async fn logged_in_client(node: &Node, name: Option<&str>) -> SkeinResult<Arc<Socket>> {
    let socket = raw_client(node).await?;
    let login = LoginRequest {
        credential: test_credential(),
        client_name: name.map(NodeName::from),
    };
    let data = serde_json::to_value(&login)?;
    tokio::try_join!(
        socket.invoke(LOGIN_PROCEDURE, data, None),
        socket.authenticated(),
    )?;
    Ok(socket)
}

/// How a [`StubPeer`] answers `getChannelData`
#[derive(Clone, Debug)]
pub enum StubBehavior {
    /// Answer with a snapshot holding these values
    Serve(Vec<Value>),
    /// Answer every read with an error
    Refuse,
    /// Accept reads and never answer
    Hang,
}

/// A scripted peer that accepts any login and answers reads per its behavior
pub struct StubPeer {
    name: NodeName,
    server: Arc<Server>,
    task: JoinHandle<()>,
}

impl StubPeer {
    pub async fn start(name: &str, behavior: StubBehavior) -> SkeinResult<Self> {
        let server = Server::bind("127.0.0.1:0", Arc::new(AllowAll), Exchange::default()).await?;
        let name = NodeName::from(name);
        let task = tokio::spawn(run_stub(server.listener(), name.clone(), behavior));
        server.start()?;
        Ok(StubPeer { name, server, task })
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn key(&self) -> PeerKey {
        PeerKey::new("127.0.0.1", self.server.local_addr().port())
    }

    pub fn shutdown(&self) {
        self.server.shutdown();
        self.task.abort();
    }
}

async fn run_stub(mut events: broadcast::Receiver<ServerEvent>, name: NodeName, behavior: StubBehavior) {
    while let Ok(event) = events.recv().await {
        if let ServerEvent::Connection(socket) = event {
            debug!(stub = %name, socket = socket.id(), "stub accepted connection");
            tokio::spawn(accept_any_login(Arc::clone(&socket), name.clone()));
            tokio::spawn(answer_reads(socket, name.clone(), behavior.clone()));
        }
    }
}

async fn accept_any_login(socket: Arc<Socket>, name: NodeName) {
    let mut logins = socket.procedure(LOGIN_PROCEDURE);
    while let Some(request) = logins.recv().await {
        let client_name = serde_json::from_value::<LoginRequest>(request.data.clone())
            .ok()
            .and_then(|login| login.client_name);
        let token = AuthToken {
            username: TEST_USER.to_string(),
            client_name,
            server_name: Some(name.clone()),
        };
        match socket.set_auth_token(token) {
            Ok(()) => request.end(Value::from(LOGIN_SUCCESS)),
            Err(e) => request.error(e),
        }
    }
}

async fn answer_reads(socket: Arc<Socket>, name: NodeName, behavior: StubBehavior) {
    let mut reads = socket.procedure(GET_CHANNEL_DATA_PROCEDURE);
    let mut held: Vec<Request> = Vec::new();
    while let Some(request) = reads.recv().await {
        match &behavior {
            StubBehavior::Serve(values) => {
                let records = values
                    .iter()
                    .map(ChannelRecord::now)
                    .map(|record| record.map(ReadRecord::from))
                    .collect::<SkeinResult<Vec<_>>>();
                match records {
                    Ok(data) => {
                        let snapshot = ChannelSnapshot {
                            server: name.clone(),
                            data,
                        };
                        match serde_json::to_value(snapshot) {
                            Ok(value) => request.end(value),
                            Err(e) => request.error(e),
                        }
                    }
                    Err(e) => request.error(e),
                }
            }
            StubBehavior::Refuse => request.error("stub refuses reads"),
            StubBehavior::Hang => held.push(request),
        }
    }
}
