//! Authorization pipeline
//!
//! Inbound: subscribe, transmit and publish-in require an authenticated
//! socket. An authenticated publish-in is redirected through the channel write
//! path and the original action is dropped, so the message is published once.
//!
//! Outbound: every publish-out is tagged with this node's name and then
//! withheld from any destination already in the envelope's originator set.

use std::sync::Arc;

use serde_json::Value;
use tracing::{trace, warn};

use skein_core::{has_seen, tag_originator, Envelope, NodeName, SkeinError};
use skein_transport::{Action, ActionKind, Middleware, Verdict};

use crate::ChannelService;

pub struct AuthorizationPipeline {
    name: NodeName,
    channels: Arc<ChannelService>,
    originator_warn_threshold: usize,
}

impl AuthorizationPipeline {
    pub fn new(name: NodeName, channels: Arc<ChannelService>, originator_warn_threshold: usize) -> Self {
        Self {
            name,
            channels,
            originator_warn_threshold,
        }
    }

    /// Tag `data` with this node and decide whether `destination` may receive it.
    ///
    /// Returns the tagged payload to send, or `None` when the destination has
    /// already seen it. A destination with no declared name is always allowed.
    pub fn admit(&self, destination: Option<&NodeName>, data: Value) -> Option<Value> {
        let envelope = tag_originator(&self.name, Envelope::from_value(data));

        let visited = envelope.originator_count();
        if visited > self.originator_warn_threshold {
            let path: Vec<&str> = envelope.originators().map(NodeName::as_str).collect();
            warn!(visited, threshold = self.originator_warn_threshold, ?path, "envelope visited many nodes");
        }

        match destination {
            Some(destination) if has_seen(destination, &envelope) => {
                trace!(%destination, "suppressing loop back");
                None
            }
            _ => Some(envelope.into_value()),
        }
    }
}

impl Middleware for AuthorizationPipeline {
    fn inbound(&self, action: &mut Action) -> Verdict {
        match action.kind {
            ActionKind::Subscribe | ActionKind::Transmit | ActionKind::PublishIn => {}
            _ => return Verdict::Allow,
        }

        if !action.socket.is_authenticated() {
            return Verdict::Block(Some(SkeinError::AuthenticationRequired));
        }

        if action.kind == ActionKind::PublishIn && !action.data.is_null() {
            if let Some(channel) = action.channel.as_ref() {
                let data = std::mem::take(&mut action.data);
                if let Err(e) = self.channels.write(channel, data) {
                    warn!(%channel, socket = action.socket.id(), error = %e, "inbound publish not stored");
                }
                return Verdict::Block(None);
            }
        }

        Verdict::Allow
    }

    fn outbound(&self, action: &mut Action) -> Verdict {
        if action.kind != ActionKind::PublishOut {
            return Verdict::Allow;
        }
        if !action.socket.is_authenticated() {
            return Verdict::Block(Some(SkeinError::AuthenticationRequired));
        }

        let destination = action.socket.auth_token().and_then(|token| token.client_name);
        let data = std::mem::take(&mut action.data);
        match self.admit(destination.as_ref(), data) {
            Some(tagged) => {
                action.data = tagged;
                Verdict::Allow
            }
            None => Verdict::Block(None),
        }
    }
}
