//! Rust client for the phoenixd payments websocket.
//!
//! The crate is organized by concern:
//! - `config`: node settings and validated connection parameters.
//! - `stream`: persistent websocket, reconnect handling, and event fan-out.
//! - `relay`: routes payment events to downstream sessions by external id.
//! - `retry`: reconnect backoff and timeout utilities.

/// Node settings, connection parameters, and stream options.
pub mod config;
/// Per-session routing of payment events.
pub mod relay;
/// Reconnect backoff and timeout helpers.
pub mod retry;
/// Payments websocket client, codec, dispatcher, and event types.
pub mod stream;
