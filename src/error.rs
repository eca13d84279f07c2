//! Caller-visible error taxonomy for the bridge.
//!
//! Transport-level faults (a single peer failing a send, malformed inbound
//! JSON on the socket) are contained at the reactor and only logged; the
//! variants here are the only failures that cross into caller threads.

use thiserror::Error;

/// Failures surfaced by the [`Bridge`](crate::Bridge) facade.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A command was issued while no peers were attached to the bridge.
    ///
    /// Returned immediately, without waiting out the response timeout.
    #[error("no connected peers")]
    NoPeersConnected,

    /// The bounded wait for a command response elapsed.
    ///
    /// The remote command is not cancelled; a late reply becomes a stale
    /// entry that the next call's pre-send drain discards.
    #[error("timed out waiting for a command response")]
    ResponseTimeout,

    /// The bridge is not running (never started, stopped, or torn down
    /// while a caller was waiting).
    #[error("bridge is not running")]
    NotRunning,

    /// Binding or listening failed during `start()`.
    ///
    /// The bridge is left in the `Stopped` state.
    #[error("failed to start bridge listener")]
    Startup(#[source] std::io::Error),

    /// A peer replied, but the payload could not be interpreted by a
    /// convenience wrapper (missing fields or `success: false`).
    #[error("unusable command response: {0}")]
    BadResponse(String),
}
