//! skein Transport Layer - TCP sockets between mesh nodes
//!
//! This crate provides:
//! - Sockets with connection and authentication state
//! - Remote procedure calls in both directions over one connection
//! - Channel subscribe/publish between a client and a server
//! - A process-wide exchange for named-channel broadcast
//! - Inbound/outbound middleware hooks that allow or block every action

pub mod client;
pub mod exchange;
pub mod middleware;
pub mod server;
pub mod socket;

pub use exchange::*;
pub use middleware::*;
pub use server::*;
pub use socket::*;

pub use skein_wire::MAX_FRAME_SIZE;
