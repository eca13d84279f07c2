//! Wire protocol for the socket transport.
//!
//! Envelopes are JSON objects with a `type` discriminator, one per line
//! (newline-delimited). The pipe transport has its own framing, see
//! [`crate::pipe`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command queued by the facade, awaiting broadcast by the reactor.
///
/// Dequeued exactly once; the reactor never matches it against later
/// replies — correlation is entirely the caller side's discipline.
#[derive(Debug, Clone)]
pub struct Command {
    /// Command name understood by the extension (e.g. `get_cookies_by_domain`).
    pub action: String,
    /// Free-form JSON parameters.
    pub params: Value,
    /// Process-unique correlation token (monotonic counter).
    pub command_id: String,
}

/// JSON envelope exchanged on the socket transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Peer → bridge handshake message, acknowledged directly.
    Greeting {
        /// Free-form greeting text.
        content: String,
    },
    /// Peer → bridge plain text, echoed back directly.
    Text {
        /// Text to echo.
        content: String,
    },
    /// Bridge → peer command broadcast.
    BackendCommand {
        /// Command name.
        command: String,
        /// Free-form JSON parameters.
        #[serde(default)]
        params: Value,
        /// Correlation token (informational; peers do not echo it back).
        command_id: String,
    },
    /// Peer → bridge reply to a broadcast command.
    CommandResponse {
        /// Reply payload, forwarded to the waiting caller as-is.
        data: Value,
    },
    /// Bridge → peer acknowledgment of a greeting.
    Response {
        /// Acknowledgment text.
        content: String,
    },
    /// Bridge → peer echo of a text message.
    Echo {
        /// Echoed text.
        content: String,
    },
    /// Bridge → peer error report (malformed or unexpected message).
    Error {
        /// Human-readable description.
        message: String,
    },
}

impl Envelope {
    /// Serialize this envelope as one newline-terminated wire line.
    pub fn to_line(&self) -> String {
        let mut line =
            serde_json::to_string(self).expect("JSON serialization cannot fail");
        line.push('\n');
        line
    }
}

impl From<Command> for Envelope {
    fn from(cmd: Command) -> Self {
        Envelope::BackendCommand {
            command: cmd.action,
            params: cmd.params,
            command_id: cmd.command_id,
        }
    }
}
