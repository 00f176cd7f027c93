//! Orientation stream client: reconnecting WebSocket link with a local JSON API.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Exponential reconnect delays with optional jitter.
pub mod backoff;
/// CLI parsing and TOML configuration.
pub mod config;
/// Decoder stage publishing the current orientation sample.
pub mod feed;
/// Line-delimited JSON API over TCP/Unix sockets.
pub mod local_api;
/// Connection lifecycle state machine.
pub mod machine;
/// HTTP status endpoint check.
pub mod probe;
/// Stream actor, control handle and owner.
pub mod stream;
/// Injectable single-shot timers.
pub mod timer;
/// WebSocket transports.
pub mod transport;
