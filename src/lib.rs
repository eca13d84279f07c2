//! Extbridge - local command bridge to a browser-extension peer.
//!
//! This crate provides the core functionality for the extbridge daemon:
//! a long-lived socket server that lets synchronous callers (GUI action
//! handlers, scripts) issue named commands to an independently-connected
//! browser-extension process and block until a correlated reply arrives
//! or a deadline expires.
//!
//! The public surface is the [`Bridge`] facade; the [`pipe`] module is an
//! independent length-prefixed framing codec for peers reached over a
//! spawned process's stdin/stdout instead of the socket.

pub mod bridge;
pub mod config;
pub mod error;
pub mod pipe;

pub use bridge::{Bridge, BridgeState};
pub use config::BridgeConfig;
pub use error::BridgeError;
