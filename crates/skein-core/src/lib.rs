//! skein Core - Fundamental types shared by every mesh crate
//!
//! This crate defines:
//! - Identifiers (NodeName, PeerKey, ChannelName)
//! - The message envelope and its originator set (loop prevention)
//! - Channel records and fan-out read results
//! - Subscription intents and authentication tokens
//! - The common error type

pub mod auth;
pub mod envelope;
pub mod error;
pub mod id;
pub mod intent;
pub mod record;

pub use auth::*;
pub use envelope::*;
pub use error::*;
pub use id::*;
pub use intent::*;
pub use record::*;
