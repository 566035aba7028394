//! Error types for the mesh

use thiserror::Error;

use crate::{ChannelName, PeerKey};

/// Core skein errors
#[derive(Error, Debug)]
pub enum SkeinError {
    // Authorization errors
    #[error("socket not authenticated")]
    AuthenticationRequired,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("authentication with {0} did not complete in time")]
    AuthenticationTimeout(PeerKey),

    // Channel errors
    #[error("no history for channel {0}")]
    ChannelReadMiss(ChannelName),

    #[error("write failed: {0}")]
    WriteFailure(String),

    // Federation errors
    #[error("invocation on peer {peer} failed: {reason}")]
    PeerInvocationFailure { peer: String, reason: String },

    #[error("malformed connect request: {0}")]
    MalformedConnectRequest(String),

    #[error("peer link {0} is not usable")]
    PeerUnavailable(PeerKey),

    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Transport errors
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Operation timed out")]
    Timeout,

    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("subscription to {channel} refused: {reason}")]
    SubscriptionRefused { channel: ChannelName, reason: String },

    // Local environment
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for skein operations
pub type SkeinResult<T> = Result<T, SkeinError>;
