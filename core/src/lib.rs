//! Core library for the Weft mesh daemon: membership gossip, session-rotating
//! mutual authentication, the tunnel packet codec, and the routing engine.
//! Everything transport-facing (the HTTP surface, TLS, the privileged tunnel
//! process) lives in the daemon crate; this crate is runnable entirely
//! in-process, which is how the tests drive it.

pub mod auth;
pub mod client;
pub mod codec;
pub mod concurrent_lock;
pub mod config;
pub mod device;
pub mod error;
pub mod faults;
pub mod ip;
pub mod manager;
pub mod metrics;
pub mod nodes;
pub mod registrations;
pub mod router;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use manager::Manager;
