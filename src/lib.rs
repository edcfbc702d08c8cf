//! ws-echo: a WebSocket echo server
//!
//! Clients upgrade on `/echo` and every text or binary message they send is
//! written back unchanged on the same connection. A static page on `/`
//! provides a browser client.
//!
//! Features:
//! - Per-connection echo loop with strict receive-then-send ordering
//! - Configurable origin policy and WebSocket buffer sizes
//! - JSON error responses for failed upgrades
//! - Graceful shutdown that closes open sessions
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod echo;
pub mod server;
pub mod upgrade;

#[cfg(test)]
mod log_capture;
