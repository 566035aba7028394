//! Server-side action hooks
//!
//! Every inbound action from a client and every outbound publish to a client
//! passes through a [`Middleware`] before it takes effect.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use skein_core::{ChannelName, SkeinError};

use crate::Socket;

/// Kind of action being authorized
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Client asks to subscribe to a channel
    Subscribe,
    /// Client sends a raw named event
    Transmit,
    /// Client publishes into a channel
    PublishIn,
    /// Client calls a procedure
    Invoke,
    /// Server is about to deliver a channel message to a client
    PublishOut,
}

/// A pending action. Middleware may rewrite `data` before allowing it.
pub struct Action {
    pub kind: ActionKind,
    pub socket: Arc<Socket>,
    pub channel: Option<ChannelName>,
    /// Procedure name for `Invoke`, event name for `Transmit`
    pub name: Option<String>,
    pub data: Value,
}

impl Action {
    pub fn new(kind: ActionKind, socket: Arc<Socket>, data: Value) -> Self {
        Self {
            kind,
            socket,
            channel: None,
            name: None,
            data,
        }
    }

    pub fn on_channel(mut self, channel: ChannelName) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("kind", &self.kind)
            .field("socket", &self.socket.id())
            .field("channel", &self.channel)
            .field("name", &self.name)
            .finish()
    }
}

/// Outcome of a middleware check
#[derive(Debug)]
pub enum Verdict {
    Allow,
    /// Drop the action. With an error the client is told why where the
    /// protocol has a way to say so; without one the block is silent.
    Block(Option<SkeinError>),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

pub trait Middleware: Send + Sync + 'static {
    fn inbound(&self, _action: &mut Action) -> Verdict {
        Verdict::Allow
    }

    fn outbound(&self, _action: &mut Action) -> Verdict {
        Verdict::Allow
    }
}

/// Lets every action through
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Middleware for AllowAll {}
