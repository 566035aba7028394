//! Socket handle shared by both ends of a TCP link
//!
//! A socket owns:
//! - Connection state (connecting, open, closed) and authentication state
//! - The outgoing frame queue drained by a writer task
//! - Pending calls awaiting a `Reply`
//! - Procedure listeners, with a backlog for calls that arrive before a
//!   listener registers
//! - Channel streams (client side) and exchange forwarders (server side)

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use skein_core::{AuthToken, ChannelName, PeerKey, SkeinError, SkeinResult};
use skein_wire::{decode, encode, CallId, Frame, Outcome};

/// Process-unique socket identifier
pub type SocketId = u64;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

const EVENT_CAPACITY: usize = 64;
/// Calls held per socket for procedures nobody listens to yet
const MAX_BACKLOG: usize = 64;
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Which end of the link this socket is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Accepted by a local server
    Server,
    /// Dialed by this process
    Client,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Status {
    state: SocketState,
    auth: AuthState,
}

/// Lifecycle notifications delivered to socket listeners
#[derive(Clone, Debug)]
pub enum SocketEvent {
    Connect,
    Authenticate(AuthToken),
    Error(String),
    Close { reason: String },
}

/// An incoming procedure call.
///
/// Dropping a request without answering replies with an error so the caller
/// is never left waiting.
pub struct Request {
    pub procedure: String,
    pub data: Value,
    id: CallId,
    reply: Option<mpsc::UnboundedSender<Frame>>,
}

impl Request {
    /// Answer successfully
    pub fn end(mut self, value: Value) {
        self.respond(Outcome::Ok(value));
    }

    /// Answer with an error message
    pub fn error(mut self, message: impl fmt::Display) {
        self.respond(Outcome::Err(message.to_string()));
    }

    fn respond(&mut self, outcome: Outcome) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Frame::Reply {
                id: self.id,
                outcome,
            });
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.reply.is_some() {
            let message = format!("procedure {} did not answer", self.procedure);
            self.respond(Outcome::Err(message));
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("procedure", &self.procedure)
            .field("id", &self.id)
            .finish()
    }
}

#[derive(Default)]
struct Procedures {
    listeners: HashMap<String, mpsc::UnboundedSender<Request>>,
    backlog: HashMap<String, Vec<Request>>,
}

/// Receives frames read off a socket that are not replies
pub(crate) trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, socket: &Arc<Socket>, frame: Frame);

    fn on_close(&self, _socket: &Arc<Socket>, _reason: &str) {}
}

/// One end of a TCP link
pub struct Socket {
    id: SocketId,
    role: Role,
    peer: String,
    pub(crate) dial: Option<PeerKey>,
    status: watch::Sender<Status>,
    token: RwLock<Option<AuthToken>>,
    outgoing: mpsc::UnboundedSender<Frame>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    next_call: AtomicU64,
    calls: Mutex<HashMap<CallId, oneshot::Sender<Outcome>>>,
    procedures: Mutex<Procedures>,
    receivers: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
    streams: Mutex<HashMap<ChannelName, mpsc::UnboundedSender<Value>>>,
    pending_subscribes: Mutex<HashMap<ChannelName, oneshot::Sender<SkeinResult<()>>>>,
    forwarders: Mutex<HashMap<ChannelName, JoinHandle<()>>>,
    events: broadcast::Sender<SocketEvent>,
}

impl Socket {
    pub(crate) fn new(role: Role, peer: String, dial: Option<PeerKey>) -> Arc<Self> {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(Status {
            state: SocketState::Connecting,
            auth: AuthState::Unauthenticated,
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new(Socket {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            role,
            peer,
            dial,
            status,
            token: RwLock::new(None),
            outgoing,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            next_call: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
            procedures: Mutex::new(Procedures::default()),
            receivers: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            pending_subscribes: Mutex::new(HashMap::new()),
            forwarders: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Remote address label
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> SocketState {
        self.status.borrow().state
    }

    pub fn auth_state(&self) -> AuthState {
        self.status.borrow().auth
    }

    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state() == AuthState::Authenticated
    }

    pub fn auth_token(&self) -> Option<AuthToken> {
        self.token.read().clone()
    }

    /// Subscribe to lifecycle events. Register before `open` to observe `Connect`.
    pub fn listener(&self) -> broadcast::Receiver<SocketEvent> {
        self.events.subscribe()
    }

    /// Attach a token to this connection and tell the remote end about it
    pub fn set_auth_token(&self, token: AuthToken) -> SkeinResult<()> {
        self.accept_token(token.clone());
        self.send(Frame::Authenticated { token })
    }

    /// Wait until the socket is authenticated, or fail once it closes
    pub async fn authenticated(&self) -> SkeinResult<AuthToken> {
        let mut rx = self.status.subscribe();
        let status = rx
            .wait_for(|s| s.auth == AuthState::Authenticated || s.state == SocketState::Closed)
            .await
            .map(|s| *s)
            .map_err(|_| SkeinError::ConnectionClosed)?;

        if status.auth == AuthState::Authenticated {
            self.auth_token().ok_or(SkeinError::AuthenticationRequired)
        } else {
            Err(SkeinError::ConnectionClosed)
        }
    }

    /// Resolve once the socket is closed
    pub async fn closed(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|s| s.state == SocketState::Closed).await;
    }

    /// Call a procedure on the remote end.
    ///
    /// With a `timeout` the pending call is dropped when it expires.
    pub async fn invoke(
        &self,
        procedure: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> SkeinResult<Value> {
        let id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(id, tx);

        let frame = Frame::Invoke {
            id,
            procedure: procedure.to_string(),
            data,
        };
        if let Err(e) = self.send(frame) {
            self.calls.lock().remove(&id);
            return Err(e);
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.calls.lock().remove(&id);
                    return Err(SkeinError::Timeout);
                }
            },
            None => rx.await,
        };

        outcome
            .map_err(|_| SkeinError::ConnectionClosed)?
            .into_result()
            .map_err(SkeinError::RemoteError)
    }

    /// Listen for calls to `name`. Calls received before registration are
    /// delivered first.
    pub fn procedure(&self, name: &str) -> mpsc::UnboundedReceiver<Request> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut procedures = self.procedures.lock();
        for request in procedures.backlog.remove(name).unwrap_or_default() {
            let _ = tx.send(request);
        }
        if self.state() != SocketState::Closed {
            procedures.listeners.insert(name.to_string(), tx);
        }
        rx
    }

    /// Listen for raw `transmit` events named `event`
    pub fn receiver(&self, event: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.state() != SocketState::Closed {
            self.receivers.lock().insert(event.to_string(), tx);
        }
        rx
    }

    /// Send a raw named event
    pub fn transmit(&self, event: &str, data: Value) -> SkeinResult<()> {
        self.send(Frame::Transmit {
            event: event.to_string(),
            data,
        })
    }

    /// Send a publish frame for `channel`.
    ///
    /// From a client this is a publish into the remote exchange; from a server
    /// it delivers a message on a channel the client subscribed to.
    pub fn publish(&self, channel: &ChannelName, data: Value) -> SkeinResult<()> {
        self.send(Frame::Publish {
            channel: channel.clone(),
            data,
        })
    }

    /// Subscribe to a channel on the remote server and receive its messages
    pub async fn subscribe(
        &self,
        channel: &ChannelName,
    ) -> SkeinResult<mpsc::UnboundedReceiver<Value>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending_subscribes.lock().insert(channel.clone(), ack_tx);
        self.streams.lock().insert(channel.clone(), tx);

        if let Err(e) = self.send(Frame::Subscribe {
            channel: channel.clone(),
        }) {
            self.pending_subscribes.lock().remove(channel);
            self.streams.lock().remove(channel);
            return Err(e);
        }

        match ack_rx.await {
            Ok(Ok(())) => Ok(rx),
            Ok(Err(e)) => {
                self.streams.lock().remove(channel);
                Err(e)
            }
            Err(_) => Err(SkeinError::ConnectionClosed),
        }
    }

    pub fn unsubscribe(&self, channel: &ChannelName) -> SkeinResult<()> {
        self.streams.lock().remove(channel);
        self.send(Frame::Unsubscribe {
            channel: channel.clone(),
        })
    }

    /// Close the link. Pending calls fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.shutdown("closed locally");
    }

    pub(crate) fn send(&self, frame: Frame) -> SkeinResult<()> {
        if self.state() == SocketState::Closed {
            return Err(SkeinError::ConnectionClosed);
        }
        self.outgoing
            .send(frame)
            .map_err(|_| SkeinError::ConnectionClosed)
    }

    pub(crate) fn emit(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn accept_token(&self, token: AuthToken) {
        *self.token.write() = Some(token.clone());
        self.status.send_modify(|s| s.auth = AuthState::Authenticated);
        self.emit(SocketEvent::Authenticate(token));
    }

    pub(crate) fn dispatch_invoke(&self, id: CallId, procedure: String, data: Value) {
        let request = Request {
            procedure,
            data,
            id,
            reply: Some(self.outgoing.clone()),
        };

        let mut procedures = self.procedures.lock();
        match procedures.listeners.get(&request.procedure) {
            Some(listener) => {
                if let Err(mpsc::error::SendError(request)) = listener.send(request) {
                    procedures.listeners.remove(&request.procedure);
                }
            }
            None => {
                let held: usize = procedures.backlog.values().map(Vec::len).sum();
                if held >= MAX_BACKLOG {
                    warn!(socket = self.id, procedure = %request.procedure, held, "call backlog full, refusing call");
                    let message = format!("procedure {} is not available", request.procedure);
                    request.error(message);
                    return;
                }
                trace!(socket = self.id, procedure = %request.procedure, "buffering call");
                procedures
                    .backlog
                    .entry(request.procedure.clone())
                    .or_default()
                    .push(request);
            }
        }
    }

    pub(crate) fn deliver_transmit(&self, event: &str, data: Value) {
        let mut receivers = self.receivers.lock();
        if let Some(tx) = receivers.get(event) {
            if tx.send(data).is_err() {
                receivers.remove(event);
            }
        }
    }

    pub(crate) fn deliver_publish(&self, channel: &ChannelName, data: Value) {
        let mut streams = self.streams.lock();
        match streams.get(channel) {
            Some(tx) => {
                if tx.send(data).is_err() {
                    streams.remove(channel);
                }
            }
            None => trace!(socket = self.id, %channel, "publish for unknown stream"),
        }
    }

    pub(crate) fn resolve_subscribe(&self, channel: &ChannelName, result: SkeinResult<()>) {
        if let Some(ack) = self.pending_subscribes.lock().remove(channel) {
            let _ = ack.send(result);
        }
    }

    pub(crate) fn add_forwarder(&self, channel: ChannelName, handle: JoinHandle<()>) {
        if self.state() == SocketState::Closed {
            handle.abort();
            return;
        }
        if let Some(previous) = self.forwarders.lock().insert(channel, handle) {
            previous.abort();
        }
    }

    pub(crate) fn remove_forwarder(&self, channel: &ChannelName) {
        if let Some(handle) = self.forwarders.lock().remove(channel) {
            handle.abort();
        }
    }

    /// Mark the socket closed and release everything waiting on it.
    /// Only the first call has any effect.
    pub(crate) fn shutdown(&self, reason: &str) {
        let previous = self.status.send_replace(Status {
            state: SocketState::Closed,
            auth: self.auth_state(),
        });
        if previous.state == SocketState::Closed {
            return;
        }

        self.calls.lock().clear();
        self.pending_subscribes.lock().clear();
        self.streams.lock().clear();
        self.receivers.lock().clear();
        *self.procedures.lock() = Procedures::default();
        for (_, handle) in self.forwarders.lock().drain() {
            handle.abort();
        }

        debug!(socket = self.id, peer = %self.peer, reason, "socket closed");
        self.emit(SocketEvent::Close {
            reason: reason.to_string(),
        });
    }

    /// Start the reader and writer tasks for an established stream
    pub(crate) fn spawn_io(self: &Arc<Self>, stream: TcpStream, handler: Arc<dyn FrameHandler>) {
        let Some(outgoing_rx) = self.outgoing_rx.lock().take() else {
            warn!(socket = self.id, "socket already attached to a stream");
            return;
        };

        self.status.send_modify(|s| s.state = SocketState::Open);
        let (reader, writer) = stream.into_split();
        tokio::spawn(write_loop(Arc::clone(self), writer, outgoing_rx));
        tokio::spawn(read_loop(Arc::clone(self), reader, handler));
    }

    fn dispatch(self: &Arc<Self>, frame: Frame, handler: &dyn FrameHandler) {
        match frame {
            Frame::Reply { id, outcome } => match self.calls.lock().remove(&id) {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => trace!(socket = self.id, id, "reply for unknown call"),
            },
            other => handler.on_frame(self, other),
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("auth", &self.auth_state())
            .finish()
    }
}

async fn write_loop(
    socket: Arc<Socket>,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let Some(bytes) = encode_outgoing(socket.id, &frame) else { continue };
                if let Err(e) = writer.write_all(&bytes).await {
                    socket.shutdown(&format!("write failed: {e}"));
                    break;
                }
            }
            _ = socket.closed() => break,
        }
    }
    let _ = writer.shutdown().await;
}

/// Encode `frame` for the wire.
///
/// A reply that cannot be encoded is swapped for an error reply with the same
/// id so the caller fails at once instead of waiting out its timeout.
fn encode_outgoing(socket: SocketId, frame: &Frame) -> Option<Bytes> {
    let error = match encode(frame) {
        Ok(bytes) => return Some(bytes),
        Err(e) => e,
    };

    match frame {
        Frame::Reply { id, .. } => {
            warn!(socket, id, error = %error, "reply not encodable, answering with an error");
            let fallback = Frame::Reply {
                id: *id,
                outcome: Outcome::Err(error.to_string()),
            };
            encode(&fallback).ok()
        }
        Frame::Publish { channel, .. } => {
            warn!(socket, %channel, error = %error, "dropping unencodable publish");
            None
        }
        other => {
            warn!(socket, kind = other.kind(), error = %error, "dropping unencodable frame");
            None
        }
    }
}

async fn read_loop(socket: Arc<Socket>, mut reader: OwnedReadHalf, handler: Arc<dyn FrameHandler>) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let reason = loop {
        match decode(&mut buf) {
            Ok(Some(frame)) => {
                socket.dispatch(frame, handler.as_ref());
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(socket = socket.id, error = %e, "protocol error");
                break format!("protocol error: {e}");
            }
        }

        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break "connection closed by peer".to_string(),
                Ok(_) => {}
                Err(e) => break format!("read failed: {e}"),
            },
            _ = socket.closed() => break "closed locally".to_string(),
        }
    };

    socket.shutdown(&reason);
    handler.on_close(&socket, &reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_socket_starts_connecting() {
        let socket = Socket::new(Role::Client, "127.0.0.1:1".into(), None);
        assert_eq!(socket.state(), SocketState::Connecting);
        assert!(!socket.is_authenticated());
        assert!(socket.auth_token().is_none());
    }

    #[tokio::test]
    async fn test_calls_buffer_until_procedure_registers() {
        let socket = Socket::new(Role::Server, "peer".into(), None);
        socket.dispatch_invoke(1, "ping".into(), json!(1));
        socket.dispatch_invoke(2, "ping".into(), json!(2));

        let mut requests = socket.procedure("ping");
        assert_eq!(requests.recv().await.unwrap().data, json!(1));
        assert_eq!(requests.recv().await.unwrap().data, json!(2));
    }

    #[tokio::test]
    async fn test_backlog_refuses_calls_once_full() {
        let socket = Socket::new(Role::Server, "peer".into(), None);
        let mut frames = socket.outgoing_rx.lock().take().unwrap();
        for id in 0..MAX_BACKLOG as u64 {
            socket.dispatch_invoke(id, format!("unknown-{id}"), Value::Null);
        }
        assert!(frames.try_recv().is_err());

        socket.dispatch_invoke(1000, "one-too-many".into(), Value::Null);
        match frames.try_recv().unwrap() {
            Frame::Reply { id, outcome: Outcome::Err(message) } => {
                assert_eq!(id, 1000);
                assert!(message.contains("one-too-many"));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        // calls already held still reach a late listener
        let mut first = socket.procedure("unknown-0");
        assert_eq!(first.recv().await.unwrap().id, 0);
    }

    #[tokio::test]
    async fn test_dropped_request_replies_error() {
        let socket = Socket::new(Role::Server, "peer".into(), None);
        let mut frames = socket.outgoing_rx.lock().take().unwrap();
        socket.dispatch_invoke(9, "ping".into(), Value::Null);
        drop(socket.procedure("ping").recv().await);

        match frames.recv().await.unwrap() {
            Frame::Reply { id, outcome } => {
                assert_eq!(id, 9);
                assert!(matches!(outcome, Outcome::Err(_)));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_waiters() {
        let socket = Socket::new(Role::Client, "peer".into(), None);
        let mut events = socket.listener();
        socket.shutdown("test");
        socket.shutdown("again");

        assert!(matches!(
            socket.authenticated().await,
            Err(SkeinError::ConnectionClosed)
        ));
        assert!(matches!(
            socket.invoke("ping", Value::Null, None).await,
            Err(SkeinError::ConnectionClosed)
        ));
        assert!(matches!(events.recv().await, Ok(SocketEvent::Close { .. })));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_oversized_reply_becomes_error_reply() {
        let huge = Frame::Reply {
            id: 7,
            outcome: Outcome::Ok(Value::String("x".repeat(skein_wire::MAX_FRAME_SIZE))),
        };
        let bytes = encode_outgoing(1, &huge).unwrap();
        let mut buf = BytesMut::from(&bytes[..]);

        match decode(&mut buf).unwrap() {
            Some(Frame::Reply { id, outcome: Outcome::Err(message) }) => {
                assert_eq!(id, 7);
                assert!(message.contains("too large"), "{message}");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_oversized_publish_is_dropped() {
        let huge = Frame::Publish {
            channel: ChannelName::from("big"),
            data: Value::String("x".repeat(skein_wire::MAX_FRAME_SIZE)),
        };
        assert!(encode_outgoing(1, &huge).is_none());

        let small = Frame::Publish {
            channel: ChannelName::from("big"),
            data: json!(1),
        };
        assert!(encode_outgoing(1, &small).is_some());
    }

    #[tokio::test]
    async fn test_accept_token_marks_authenticated() {
        let socket = Socket::new(Role::Client, "peer".into(), None);
        socket.accept_token(AuthToken {
            username: "kyle".into(),
            client_name: None,
            server_name: Some("b".into()),
        });
        let token = socket.authenticated().await.unwrap();
        assert_eq!(token.username, "kyle");
        assert!(socket.is_authenticated());
    }
}
