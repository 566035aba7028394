//! skein Wire Protocol - Frames exchanged between mesh nodes
//!
//! Every frame on a peer connection is:
//! - a 4-byte big-endian body length
//! - a JSON body describing one action (invoke, reply, subscribe, publish, ...)

pub mod codec;
pub mod frame;

pub use codec::*;
pub use frame::*;
