//! Dialing side of the transport

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use skein_core::{PeerKey, SkeinError, SkeinResult};
use skein_wire::Frame;

use crate::socket::FrameHandler;
use crate::{Role, Socket, SocketEvent};

/// Frame handling for sockets this process dialed
struct ClientFrames;

impl FrameHandler for ClientFrames {
    fn on_frame(&self, socket: &Arc<Socket>, frame: Frame) {
        match frame {
            Frame::Invoke {
                id,
                procedure,
                data,
            } => socket.dispatch_invoke(id, procedure, data),
            Frame::Publish { channel, data } => socket.deliver_publish(&channel, data),
            Frame::Subscribed { channel } => socket.resolve_subscribe(&channel, Ok(())),
            Frame::SubscribeFail { channel, error } => {
                socket.emit(SocketEvent::Error(format!(
                    "subscription to {channel} refused: {error}"
                )));
                socket.resolve_subscribe(
                    &channel,
                    Err(SkeinError::SubscriptionRefused {
                        channel: channel.clone(),
                        reason: error,
                    }),
                );
            }
            Frame::Transmit { event, data } => socket.deliver_transmit(&event, data),
            Frame::Authenticated { token } => socket.accept_token(token),
            other => {
                debug!(socket = socket.id(), kind = other.kind(), "ignoring frame not meant for a client");
            }
        }
    }
}

impl Socket {
    /// Create an unconnected client socket for `key`.
    ///
    /// Nothing is dialed until [`Socket::open`], so listeners registered in
    /// between observe every lifecycle event.
    pub fn client(key: &PeerKey) -> Arc<Socket> {
        Socket::new(Role::Client, key.to_string(), Some(key.clone()))
    }

    /// Dial `key` and return an open socket
    pub async fn connect(key: &PeerKey) -> SkeinResult<Arc<Socket>> {
        let socket = Socket::client(key);
        let stream = TcpStream::connect((key.host.as_str(), key.port))
            .await
            .map_err(|e| SkeinError::TransportError(format!("connect to {key} failed: {e}")))?;
        socket.attach(stream);
        Ok(socket)
    }

    /// Dial in the background. Failure is reported as an `Error` event
    /// followed by `Close`.
    pub fn open(self: &Arc<Self>) -> JoinHandle<()> {
        let socket = Arc::clone(self);
        tokio::spawn(async move {
            let Some(key) = socket.dial.clone() else {
                socket.shutdown("not a client socket");
                return;
            };
            match TcpStream::connect((key.host.as_str(), key.port)).await {
                Ok(stream) => socket.attach(stream),
                Err(e) => {
                    socket.emit(SocketEvent::Error(format!("connect to {key} failed: {e}")));
                    socket.shutdown("connect failed");
                }
            }
        })
    }

    fn attach(self: &Arc<Self>, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(socket = self.id(), error = %e, "set_nodelay failed");
        }
        self.spawn_io(stream, Arc::new(ClientFrames));
        self.emit(SocketEvent::Connect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SocketState;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_reports_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let key = PeerKey::new("127.0.0.1", listener.local_addr().unwrap().port());

        let socket = Socket::client(&key);
        let mut events = socket.listener();
        socket.open();

        let _accepted = listener.accept().await.unwrap();
        assert!(matches!(events.recv().await, Ok(SocketEvent::Connect)));
        assert_eq!(socket.state(), SocketState::Open);
    }

    #[tokio::test]
    async fn test_open_failure_reports_error_then_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let key = PeerKey::new("127.0.0.1", listener.local_addr().unwrap().port());
        drop(listener);

        let socket = Socket::client(&key);
        let mut events = socket.listener();
        socket.open().await.unwrap();

        assert!(matches!(events.recv().await, Ok(SocketEvent::Error(_))));
        assert!(matches!(events.recv().await, Ok(SocketEvent::Close { .. })));
        assert_eq!(socket.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_remote_close_closes_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let key = PeerKey::new("127.0.0.1", listener.local_addr().unwrap().port());

        let socket = Socket::connect(&key).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        drop(accepted);

        tokio::time::timeout(std::time::Duration::from_secs(2), socket.closed())
            .await
            .unwrap();
        assert!(!socket.is_open());
    }
}
