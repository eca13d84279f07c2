//! Single-threaded reactor loop for the bridge.
//!
//! Runs on a dedicated `bridge-reactor` OS thread hosting a current-thread
//! tokio runtime. One `select!` loop owns all socket I/O and all registry
//! mutation: accepting peers, dispatching their inbound messages, and
//! draining the command channel. Caller threads never touch the socket.

use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

use super::protocol::{Command, Envelope};
use super::registry::{PeerConn, PeerRegistry};

/// Events produced by per-peer read tasks, consumed by the reactor loop.
#[derive(Debug)]
pub(crate) enum ReactorEvent {
    /// A complete wire line arrived from a peer.
    PeerLine {
        /// Originating peer.
        peer_id: String,
        /// Raw line, not yet parsed.
        line: String,
    },
    /// A peer closed its stream (or its read failed).
    PeerClosed {
        /// The departed peer.
        peer_id: String,
    },
}

/// Run the reactor to completion on the calling thread.
///
/// `listener` must already be bound and set non-blocking (done in
/// `Bridge::start`, so bind errors surface to the `start()` caller).
/// Sends one readiness result on `ready_tx` once the accept loop is
/// actively listening, then loops until the shutdown watch flips.
pub(crate) fn run(
    listener: StdTcpListener,
    command_rx: UnboundedReceiver<Command>,
    response_tx: std::sync::mpsc::Sender<Value>,
    shutdown_rx: watch::Receiver<bool>,
    peer_count: Arc<AtomicUsize>,
    ready_tx: std::sync::mpsc::Sender<std::io::Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match TcpListener::from_std(listener) {
            Ok(l) => l,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel::<ReactorEvent>();
        let _ = ready_tx.send(Ok(()));

        let reactor = Reactor {
            listener,
            registry: PeerRegistry::new(),
            event_tx,
            event_rx,
            command_rx,
            response_tx,
            shutdown_rx,
            peer_count,
        };
        reactor.run_loop().await;
    });
    // Dropping the runtime tears down the listener and all peer tasks.
}

/// Reactor state, owned entirely by the reactor thread.
struct Reactor {
    listener: TcpListener,
    registry: PeerRegistry,
    /// Cloned into each new peer's read task.
    event_tx: UnboundedSender<ReactorEvent>,
    event_rx: UnboundedReceiver<ReactorEvent>,
    /// Commands queued by the facade.
    command_rx: UnboundedReceiver<Command>,
    /// Fan-in of `command_response` payloads back to the facade.
    response_tx: std::sync::mpsc::Sender<Value>,
    shutdown_rx: watch::Receiver<bool>,
    /// Registry size mirror, read by the facade for fast-fail checks.
    peer_count: Arc<AtomicUsize>,
}

impl Reactor {
    /// The cooperative loop: accept, dispatch, drain commands, until
    /// shutdown. At most one command is handled per iteration.
    async fn run_loop(mut self) {
        log::info!(
            "[Bridge] reactor listening on {}",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string())
        );

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        log::info!("[Bridge] reactor shutting down");
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        self.accept_peer(stream, addr.to_string());
                    }
                    Err(e) => {
                        log::error!("[Bridge] accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event);
                }
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.broadcast_command(cmd),
                    None => {
                        log::info!("[Bridge] command channel closed, reactor exiting");
                        break;
                    }
                },
            }
        }

        self.peer_count.store(0, Ordering::Relaxed);
    }

    /// Register a newly accepted peer before handling any of its messages.
    fn accept_peer(&mut self, stream: TcpStream, addr: String) {
        let peer_id = generate_peer_id();
        log::info!("[Bridge] peer connected: {peer_id} ({addr})");

        let conn = PeerConn::new(peer_id, stream, self.event_tx.clone());
        self.registry.add(conn);
        self.sync_peer_count();
    }

    fn handle_event(&mut self, event: ReactorEvent) {
        match event {
            ReactorEvent::PeerLine { peer_id, line } => self.handle_line(&peer_id, &line),
            ReactorEvent::PeerClosed { peer_id } => {
                if self.registry.remove(&peer_id) {
                    log::info!("[Bridge] peer disconnected: {peer_id}");
                }
                self.sync_peer_count();
            }
        }
    }

    /// Parse and dispatch one inbound wire line.
    ///
    /// Malformed lines get an `error` reply and the connection stays open;
    /// the socket transport is lenient, unlike the pipe transport.
    fn handle_line(&mut self, peer_id: &str, line: &str) {
        let envelope = match serde_json::from_str::<Envelope>(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("[Bridge] malformed message from {peer_id}: {e}");
                self.registry.send_to(
                    peer_id,
                    &Envelope::Error { message: format!("malformed message: {e}") },
                );
                return;
            }
        };

        match envelope {
            Envelope::Greeting { content } => {
                self.registry.send_to(
                    peer_id,
                    &Envelope::Response { content: format!("greeting received: {content}") },
                );
            }
            Envelope::Text { content } => {
                self.registry.send_to(peer_id, &Envelope::Echo { content });
            }
            Envelope::CommandResponse { data } => {
                // Forwarded in arrival order, no command_id inspection —
                // matching is the caller side's discipline.
                if self.response_tx.send(data).is_err() {
                    log::warn!("[Bridge] response channel closed, dropping command_response");
                }
            }
            Envelope::BackendCommand { .. }
            | Envelope::Response { .. }
            | Envelope::Echo { .. }
            | Envelope::Error { .. } => {
                log::warn!("[Bridge] unexpected message type from {peer_id}");
                self.registry.send_to(
                    peer_id,
                    &Envelope::Error { message: "unexpected message type".to_string() },
                );
            }
        }
    }

    /// Wrap one dequeued command in a `backend_command` envelope and
    /// broadcast it to every attached peer.
    fn broadcast_command(&mut self, cmd: Command) {
        if self.registry.is_empty() {
            log::warn!(
                "[Bridge] no connected peers, dropping command {} ({})",
                cmd.command_id,
                cmd.action
            );
            return;
        }

        let command_id = cmd.command_id.clone();
        let delivered = self.registry.broadcast(&Envelope::from(cmd));
        self.sync_peer_count();
        log::debug!("[Bridge] command {command_id} broadcast to {delivered} peer(s)");
    }

    fn sync_peer_count(&self) {
        self.peer_count.store(self.registry.len(), Ordering::Relaxed);
    }
}

/// Generate a unique peer ID using a monotonic counter + random suffix.
fn generate_peer_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("peer:{seq:x}{rand:04x}")
}
