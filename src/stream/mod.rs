//! Payments websocket modules.
//!
//! - `client`: connection state machine, reconnect loop, and start/stop.
//! - `codec`: transport frame to text payload translation.
//! - `dispatch`: ordered, failure-isolated fan-out to subscribers.
//! - `proto`: typed events pushed by the node.

/// Websocket connection manager.
pub mod client;
/// Frame decoding and close-frame helpers.
pub mod codec;
/// Subscriber registry and event dispatch.
pub mod dispatch;
/// Node event payloads.
pub mod proto;
