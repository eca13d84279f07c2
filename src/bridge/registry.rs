//! Per-peer connection state and the broadcast registry.
//!
//! Each accepted socket connection gets a [`PeerConn`] that owns the
//! read/write tasks for the stream. The [`PeerRegistry`] is the ordered
//! set of live peers; it is owned by the reactor loop and mutated only
//! from the reactor thread.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use super::protocol::Envelope;
use super::reactor::ReactorEvent;

/// One attached peer of the socket server.
///
/// Owns read/write tasks that bridge between the stream and the reactor:
/// - Read task: splits inbound bytes into lines → `ReactorEvent` variants
/// - Write task: receives wire lines → writes to the stream
pub(crate) struct PeerConn {
    /// Unique identifier for this peer.
    peer_id: String,
    /// Sender for outgoing wire lines to this peer.
    line_tx: UnboundedSender<String>,
    /// Handle to the read task (for cleanup).
    read_handle: JoinHandle<()>,
    /// Handle to the write task (for cleanup).
    write_handle: JoinHandle<()>,
}

impl std::fmt::Debug for PeerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConn")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

impl PeerConn {
    /// Create a connection handler for an accepted stream, spawning its
    /// read and write tasks on the current runtime.
    pub(crate) fn new(
        peer_id: String,
        stream: TcpStream,
        event_tx: UnboundedSender<ReactorEvent>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();

        let read_peer_id = peer_id.clone();
        let read_handle = tokio::spawn(Self::read_loop(read_peer_id, read_half, event_tx));

        let write_peer_id = peer_id.clone();
        let write_handle = tokio::spawn(Self::write_loop(write_peer_id, write_half, line_rx));

        Self {
            peer_id,
            line_tx,
            read_handle,
            write_handle,
        }
    }

    /// Send an envelope to this peer.
    ///
    /// Returns `false` if the write task is gone (peer unreachable).
    pub(crate) fn send(&self, envelope: &Envelope) -> bool {
        self.line_tx.send(envelope.to_line()).is_ok()
    }

    /// Send an already-serialized wire line to this peer.
    ///
    /// Used by broadcast, which serializes the envelope once for all peers.
    pub(crate) fn send_raw(&self, line: String) -> bool {
        self.line_tx.send(line).is_ok()
    }

    /// Peer identifier.
    pub(crate) fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Drop this peer, aborting its read/write tasks.
    pub(crate) fn disconnect(self) {
        self.read_handle.abort();
        self.write_handle.abort();
    }

    /// Read loop — splits the stream into lines and forwards them as events.
    async fn read_loop(
        peer_id: String,
        read_half: OwnedReadHalf,
        event_tx: UnboundedSender<ReactorEvent>,
    ) {
        let mut lines = BufReader::new(read_half).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event = ReactorEvent::PeerLine {
                        peer_id: peer_id.clone(),
                        line,
                    };
                    if event_tx.send(event).is_err() {
                        return; // Reactor gone
                    }
                }
                Ok(None) => {
                    // EOF — peer closed the stream
                    log::info!("[Bridge] peer closed stream: {peer_id}");
                    let _ = event_tx.send(ReactorEvent::PeerClosed {
                        peer_id: peer_id.clone(),
                    });
                    break;
                }
                Err(e) => {
                    log::error!("[Bridge] read error for {peer_id}: {e}");
                    let _ = event_tx.send(ReactorEvent::PeerClosed {
                        peer_id: peer_id.clone(),
                    });
                    break;
                }
            }
        }
    }

    /// Write loop — receives wire lines and writes them to the stream.
    async fn write_loop(
        peer_id: String,
        mut write_half: OwnedWriteHalf,
        mut line_rx: UnboundedReceiver<String>,
    ) {
        while let Some(line) = line_rx.recv().await {
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                log::error!("[Bridge] write error for {peer_id}: {e}");
                break;
            }
        }
        // Dropping line_rx makes subsequent sends fail, which is how a
        // broadcast pass detects and prunes this peer.
    }
}

/// Ordered set of live peers.
///
/// Invariant: never contains a peer that has failed a send since its last
/// successful send — failures are pruned within the same broadcast pass.
#[derive(Debug, Default)]
pub(crate) struct PeerRegistry {
    peers: Vec<PeerConn>,
}

impl PeerRegistry {
    pub(crate) fn new() -> Self {
        Self { peers: Vec::new() }
    }

    /// Register a peer. Called on accept, before any of its messages are
    /// handled.
    pub(crate) fn add(&mut self, conn: PeerConn) {
        self.peers.push(conn);
    }

    /// Remove a peer by id, aborting its tasks. Other peers are unaffected.
    ///
    /// Returns `false` if the peer was not registered (already pruned).
    pub(crate) fn remove(&mut self, peer_id: &str) -> bool {
        match self.peers.iter().position(|p| p.peer_id() == peer_id) {
            Some(idx) => {
                self.peers.remove(idx).disconnect();
                true
            }
            None => false,
        }
    }

    /// Send an envelope to every registered peer, in registration order.
    ///
    /// The envelope is serialized once. A peer that fails the send is
    /// logged and removed; delivery to the remaining peers continues —
    /// fan-out is best-effort, not all-or-nothing.
    ///
    /// Returns the number of peers the message was delivered to.
    pub(crate) fn broadcast(&mut self, envelope: &Envelope) -> usize {
        let line = envelope.to_line();
        let mut delivered = 0;

        let mut i = 0;
        while i < self.peers.len() {
            if self.peers[i].send_raw(line.clone()) {
                delivered += 1;
                i += 1;
            } else {
                let peer = self.peers.remove(i);
                log::warn!(
                    "[Bridge] dropping peer {} after send failure",
                    peer.peer_id()
                );
                peer.disconnect();
            }
        }

        delivered
    }

    /// Send an envelope to a single peer (direct replies, not broadcast).
    pub(crate) fn send_to(&self, peer_id: &str, envelope: &Envelope) -> bool {
        self.peers
            .iter()
            .find(|p| p.peer_id() == peer_id)
            .is_some_and(|p| p.send(envelope))
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
