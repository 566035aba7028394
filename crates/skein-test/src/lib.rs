//! skein Test Harness - Multi-node scenarios over loopback
//!
//! This crate provides:
//! - Node spawning with in-memory stores and short timeouts
//! - Scripted stub peers (serving, refusing, silent)
//! - Polling helpers for asynchronous replication
//! - End-to-end mesh scenarios

pub mod harness;
pub mod mesh;

pub use harness::*;
pub use mesh::*;
