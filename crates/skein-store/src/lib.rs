//! skein Store - Local persistence for a node
//!
//! This crate provides:
//! - Append-only channel logs, one per channel, scoped to a node name
//! - Credential lists checked by the login procedure

pub mod channel;
pub mod credentials;

pub use channel::*;
pub use credentials::*;
