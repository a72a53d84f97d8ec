//! IPC protocol for the Brume split daemon architecture
//!
//! This crate defines the wire protocol spoken between the unprivileged
//! client and the privileged daemon, the framed Unix-socket transport it
//! travels over, and a typed RPC client that demultiplexes daemon replies
//! from unsolicited push events.

pub mod client;
pub mod messages;
pub mod transport;
pub mod types;
