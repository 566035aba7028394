//! skein Node - Runtime for one member of a channel mesh
//!
//! This crate wires together:
//! 1. The transport server with the authorization pipeline as middleware
//! 2. The channel write path (persist, then republish)
//! 3. Outbound peer links and their registry
//! 4. Fan-out reads across every live peer
//! 5. The HTTP gateway

pub mod channel;
pub mod config;
pub mod gateway;
pub mod node;
pub mod peer;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod telemetry;

pub use channel::*;
pub use config::*;
pub use node::*;
pub use peer::*;
pub use pipeline::*;
pub use query::FederationQuery;
pub use registry::*;
pub use telemetry::*;
