//! HTTP(S) control surface over the core mesh engine. Exposed as a library so
//! the integration tests can run full daemons in-process.

pub mod api;
pub mod state;
pub mod tls;
