//! Accepting side of the transport

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use skein_core::{ChannelName, SkeinError, SkeinResult};
use skein_wire::{Frame, Outcome};

use crate::socket::FrameHandler;
use crate::{Action, ActionKind, Exchange, Middleware, Role, Socket, SocketId, Verdict};

const SERVER_EVENT_CAPACITY: usize = 256;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server lifecycle notifications
#[derive(Clone, Debug)]
pub enum ServerEvent {
    Ready { addr: SocketAddr },
    Connection(Arc<Socket>),
    Disconnection {
        id: SocketId,
        peer: String,
        reason: String,
    },
    Error(String),
}

/// TCP server that routes client actions through middleware into an exchange
pub struct Server {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    clients: RwLock<HashMap<SocketId, Arc<Socket>>>,
    middleware: Arc<dyn Middleware>,
    exchange: Exchange,
    events: broadcast::Sender<ServerEvent>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind a listener. Connections are not accepted until [`Server::start`].
    pub async fn bind(
        addr: impl ToSocketAddrs,
        middleware: Arc<dyn Middleware>,
        exchange: Exchange,
    ) -> SkeinResult<Arc<Self>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SkeinError::TransportError(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SkeinError::TransportError(e.to_string()))?;
        let (events, _) = broadcast::channel(SERVER_EVENT_CAPACITY);

        Ok(Arc::new(Server {
            local_addr,
            listener: Mutex::new(Some(listener)),
            clients: RwLock::new(HashMap::new()),
            middleware,
            exchange,
            events,
            accept_task: Mutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// Subscribe to server events. Register before `start` to observe `Ready`.
    pub fn listener(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Snapshot of currently connected clients
    pub fn clients(&self) -> Vec<Arc<Socket>> {
        self.clients.read().values().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Start the accept loop
    pub fn start(self: &Arc<Self>) -> SkeinResult<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| SkeinError::TransportError("server already started".into()))?;

        let server = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => server.accept(stream, addr),
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        server.emit(ServerEvent::Error(e.to_string()));
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(handle);

        info!(addr = %self.local_addr, "transport listening");
        self.emit(ServerEvent::Ready {
            addr: self.local_addr,
        });
        Ok(())
    }

    /// Stop accepting and close every client
    pub fn shutdown(&self) {
        if let Some(handle) = self.accept_task.lock().take() {
            handle.abort();
        }
        for client in self.clients() {
            client.close();
        }
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(peer = %addr, error = %e, "set_nodelay failed");
        }

        let socket = Socket::new(Role::Server, addr.to_string(), None);
        self.clients.write().insert(socket.id(), Arc::clone(&socket));
        debug!(socket = socket.id(), peer = %addr, "client connected");

        let handler: Arc<dyn FrameHandler> = Arc::clone(self) as Arc<dyn FrameHandler>;
        socket.spawn_io(stream, handler);
        self.emit(ServerEvent::Connection(socket));
    }

    fn start_forwarder(&self, socket: &Arc<Socket>, channel: ChannelName) {
        let mut messages = self.exchange.subscribe(&channel);
        let middleware = Arc::clone(&self.middleware);
        let target = Arc::clone(socket);
        let forwarded = channel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let data = match messages.recv().await {
                    Ok(data) => data,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(socket = target.id(), channel = %forwarded, skipped, "subscriber lagging");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let mut action = Action::new(ActionKind::PublishOut, Arc::clone(&target), data)
                    .on_channel(forwarded.clone());
                match middleware.outbound(&mut action) {
                    Verdict::Allow => {
                        if target.publish(&forwarded, action.data).is_err() {
                            break;
                        }
                    }
                    Verdict::Block(_) => {
                        trace!(socket = target.id(), channel = %forwarded, "publish out blocked");
                    }
                }
            }
        });
        socket.add_forwarder(channel, handle);
    }
}

impl FrameHandler for Server {
    fn on_frame(&self, socket: &Arc<Socket>, frame: Frame) {
        match frame {
            Frame::Invoke {
                id,
                procedure,
                data,
            } => {
                let mut action =
                    Action::new(ActionKind::Invoke, Arc::clone(socket), data).named(procedure);
                match self.middleware.inbound(&mut action) {
                    Verdict::Allow => {
                        let procedure = action.name.take().unwrap_or_default();
                        socket.dispatch_invoke(id, procedure, action.data);
                    }
                    Verdict::Block(error) => {
                        let message = error
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "invoke blocked".to_string());
                        let _ = socket.send(Frame::Reply {
                            id,
                            outcome: Outcome::Err(message),
                        });
                    }
                }
            }
            Frame::Subscribe { channel } => {
                let mut action = Action::new(ActionKind::Subscribe, Arc::clone(socket), Default::default())
                    .on_channel(channel.clone());
                match self.middleware.inbound(&mut action) {
                    Verdict::Allow => {
                        self.start_forwarder(socket, channel.clone());
                        let _ = socket.send(Frame::Subscribed { channel });
                    }
                    Verdict::Block(error) => {
                        let error = error
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "subscription blocked".to_string());
                        debug!(socket = socket.id(), %channel, %error, "subscribe blocked");
                        let _ = socket.send(Frame::SubscribeFail { channel, error });
                    }
                }
            }
            Frame::Unsubscribe { channel } => socket.remove_forwarder(&channel),
            Frame::Publish { channel, data } => {
                let mut action = Action::new(ActionKind::PublishIn, Arc::clone(socket), data)
                    .on_channel(channel.clone());
                match self.middleware.inbound(&mut action) {
                    Verdict::Allow => {
                        self.exchange.publish(&channel, action.data);
                    }
                    Verdict::Block(Some(error)) => {
                        debug!(socket = socket.id(), %channel, %error, "publish in blocked");
                    }
                    Verdict::Block(None) => {}
                }
            }
            Frame::Transmit { event, data } => {
                let mut action =
                    Action::new(ActionKind::Transmit, Arc::clone(socket), data).named(event.clone());
                match self.middleware.inbound(&mut action) {
                    Verdict::Allow => socket.deliver_transmit(&event, action.data),
                    Verdict::Block(error) => {
                        debug!(socket = socket.id(), %event, error = ?error, "transmit blocked");
                    }
                }
            }
            other => {
                debug!(socket = socket.id(), kind = other.kind(), "ignoring frame not meant for a server");
            }
        }
    }

    fn on_close(&self, socket: &Arc<Socket>, reason: &str) {
        self.clients.write().remove(&socket.id());
        self.emit(ServerEvent::Disconnection {
            id: socket.id(),
            peer: socket.peer().to_string(),
            reason: reason.to_string(),
        });
    }
}
