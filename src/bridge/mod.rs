//! The command bridge: socket server + caller-facing synchronous facade.
//!
//! Lets a blocking caller issue a named command to a remote,
//! independently-connected browser-extension peer and wait for a
//! correlated reply, without ever touching the socket itself.
//!
//! # Architecture
//!
//! ```text
//! Caller thread(s)                     bridge-reactor thread
//! ┌──────────────────┐ command queue  ┌───────────────────────┐
//! │ Bridge (sync)    │───────────────►│ select! loop          │──► broadcast to
//! │  send_command()  │                │  accept / dispatch /  │    every peer
//! │  blocks w/ t.o.  │◄───────────────│  drain commands       │◄── command_response
//! └──────────────────┘ response queue └───────────────────────┘    from any peer
//! ```
//!
//! # Correlation contract
//!
//! Fire-and-broadcast, first-reply-wins: the facade drains the response
//! queue, enqueues the command, and takes the next `command_response`
//! payload that arrives from *any* peer. Peers do not echo `command_id`,
//! so no id matching happens anywhere in the data path; overlapping
//! callers are serialized by an internal lock so the drain discipline
//! stays sound. A late reply to a timed-out call can still satisfy the
//! next call if it lands after that call's drain.

pub mod protocol;
pub(crate) mod reactor;
pub(crate) mod registry;

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use protocol::Command;

/// Lifecycle state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Not started, or fully torn down.
    Stopped,
    /// `start()` in progress: listener bound, reactor thread coming up.
    Starting,
    /// Reactor loop live and accepting peers.
    Running,
    /// `stop()` in progress: reactor winding down.
    Stopping,
}

/// Handles owned while the reactor thread is alive.
#[derive(Debug)]
struct ReactorRuntime {
    command_tx: UnboundedSender<Command>,
    shutdown_tx: watch::Sender<bool>,
    thread: thread::JoinHandle<()>,
    local_addr: SocketAddr,
}

/// The synchronous, caller-facing bridge facade.
///
/// One bridge per process, constructed explicitly and passed by reference
/// to callers. All methods are callable from any thread; `send_command`
/// calls that overlap are serialized internally.
#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    state: Mutex<BridgeState>,
    runtime: Mutex<Option<ReactorRuntime>>,
    /// Response queue receiver. The mutex doubles as the send lock:
    /// holding it across drain + enqueue + wait serializes callers.
    responses: Mutex<Option<std::sync::mpsc::Receiver<Value>>>,
    /// Mirror of the reactor-owned registry size.
    peer_count: Arc<AtomicUsize>,
    next_command_id: AtomicU64,
}

impl Bridge {
    /// Create a stopped bridge with the given configuration.
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BridgeState::Stopped),
            runtime: Mutex::new(None),
            responses: Mutex::new(None),
            peer_count: Arc::new(AtomicUsize::new(0)),
            next_command_id: AtomicU64::new(0),
        }
    }

    /// The configuration this bridge was built with.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BridgeState {
        *self.state.lock().unwrap()
    }

    /// Whether at least one peer is attached.
    pub fn is_connected(&self) -> bool {
        self.peer_count.load(Ordering::Relaxed) > 0
    }

    /// Number of currently attached peers.
    pub fn connected_peers(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }

    /// Address the listener is bound to, once running.
    ///
    /// Mainly useful when the configured port is 0 (ephemeral).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().unwrap().as_ref().map(|rt| rt.local_addr)
    }

    /// Bind the listener and spawn the reactor thread.
    ///
    /// No-op when the bridge is already starting or running: a second
    /// `start()` never creates a second listener or worker thread.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Startup`] if binding or listening fails; the bridge
    /// stays `Stopped`.
    pub fn start(&self) -> Result<(), BridgeError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != BridgeState::Stopped {
                return Ok(());
            }
            *state = BridgeState::Starting;
        }

        match self.spawn_reactor() {
            Ok(()) => {
                *self.state.lock().unwrap() = BridgeState::Running;
                Ok(())
            }
            Err(e) => {
                *self.state.lock().unwrap() = BridgeState::Stopped;
                Err(BridgeError::Startup(e))
            }
        }
    }

    /// Bind + spawn, returning the raw I/O error on any failure so
    /// `start()` can reset the state in one place.
    fn spawn_reactor(&self) -> std::io::Result<()> {
        // Binding the std listener here (not on the reactor thread) is
        // what makes bind errors synchronous for the start() caller.
        let listener = StdTcpListener::bind(self.config.addr())?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (command_tx, command_rx) = tokio::sync::mpsc::unbounded_channel::<Command>();
        let (response_tx, response_rx) = std::sync::mpsc::channel::<Value>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::io::Result<()>>();

        self.peer_count.store(0, Ordering::Relaxed);
        let peer_count = Arc::clone(&self.peer_count);

        let thread = thread::Builder::new()
            .name("bridge-reactor".to_string())
            .spawn(move || {
                reactor::run(
                    listener,
                    command_rx,
                    response_tx,
                    shutdown_rx,
                    peer_count,
                    ready_tx,
                );
            })?;

        // Starting → Running only once the accept loop is actively listening.
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(std::io::Error::other(
                    "reactor thread exited before becoming ready",
                ));
            }
        }

        *self.runtime.lock().unwrap() = Some(ReactorRuntime {
            command_tx,
            shutdown_tx,
            thread,
            local_addr,
        });
        *self.responses.lock().unwrap() = Some(response_rx);
        log::info!("[Bridge] listening on {local_addr}");
        Ok(())
    }

    /// Tear the bridge down: close the listener, drop all peer
    /// connections, and join the reactor thread.
    ///
    /// A caller blocked inside [`send_command`](Self::send_command) wakes
    /// with [`BridgeError::NotRunning`] once the reactor's response sender
    /// is dropped. No-op if the bridge is not running.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != BridgeState::Running {
                return;
            }
            *state = BridgeState::Stopping;
        }

        let runtime = self.runtime.lock().unwrap().take();
        if let Some(rt) = runtime {
            let _ = rt.shutdown_tx.send(true);
            // Joining drops the reactor runtime: listener closed, peer
            // tasks aborted, response sender dropped.
            if rt.thread.join().is_err() {
                log::error!("[Bridge] reactor thread panicked");
            }
        }

        *self.responses.lock().unwrap() = None;
        self.peer_count.store(0, Ordering::Relaxed);
        *self.state.lock().unwrap() = BridgeState::Stopped;
        log::info!("[Bridge] stopped");
    }

    /// Issue a named command to the connected extension and wait for the
    /// next reply.
    ///
    /// Discipline, in order: fail fast when stopped or peerless; discard
    /// every response already queued (stale replies from earlier calls);
    /// enqueue the command for broadcast; block until a reply arrives or
    /// `timeout` elapses. The first `command_response` from any peer
    /// resolves the call.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotRunning`], [`BridgeError::NoPeersConnected`], or
    /// [`BridgeError::ResponseTimeout`]. A timeout does not cancel the
    /// command on the peer side.
    pub fn send_command(
        &self,
        action: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        if self.state() != BridgeState::Running {
            return Err(BridgeError::NotRunning);
        }
        if !self.is_connected() {
            return Err(BridgeError::NoPeersConnected);
        }

        // Held for the whole call: serializes overlapping callers so the
        // drain below cannot eat another caller's pending reply.
        let responses = self.responses.lock().unwrap();
        let Some(response_rx) = responses.as_ref() else {
            return Err(BridgeError::NotRunning);
        };

        let mut stale = 0;
        while response_rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            log::debug!("[Bridge] discarded {stale} stale response(s) before send");
        }

        let command = Command {
            action: action.to_string(),
            params,
            command_id: format!("cmd-{}", self.next_command_id.fetch_add(1, Ordering::Relaxed) + 1),
        };
        log::debug!("[Bridge] sending command {} ({action})", command.command_id);

        {
            let runtime = self.runtime.lock().unwrap();
            let Some(rt) = runtime.as_ref() else {
                return Err(BridgeError::NotRunning);
            };
            if rt.command_tx.send(command).is_err() {
                return Err(BridgeError::NotRunning);
            }
        }

        match response_rx.recv_timeout(timeout) {
            Ok(data) => Ok(data),
            Err(RecvTimeoutError::Timeout) => Err(BridgeError::ResponseTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::NotRunning),
        }
    }

    /// Fetch the cookies the extension holds for `domain`, formatted as a
    /// `name=value; name2=value2` header string.
    ///
    /// # Errors
    ///
    /// Everything [`send_command`](Self::send_command) returns, plus
    /// [`BridgeError::BadResponse`] when the reply is unusable.
    pub fn get_domain_cookies(&self, domain: &str) -> Result<String, BridgeError> {
        let data = self.send_command(
            "get_cookies_by_domain",
            json!({ "domain": domain }),
            self.config.command_timeout(),
        )?;
        Self::require_success(&data)?;

        let cookies = data
            .get("cookies")
            .and_then(Value::as_array)
            .ok_or_else(|| BridgeError::BadResponse("missing cookies array".to_string()))?;

        let pairs: Vec<String> = cookies
            .iter()
            .filter_map(|cookie| {
                let name = cookie.get("name")?.as_str()?;
                let value = cookie.get("value")?.as_str()?;
                Some(format!("{name}={value}"))
            })
            .collect();

        Ok(pairs.join("; "))
    }

    /// Fetch the captured requests the extension holds for `domain`.
    ///
    /// # Errors
    ///
    /// Everything [`send_command`](Self::send_command) returns, plus
    /// [`BridgeError::BadResponse`] when the reply is unusable.
    pub fn get_domain_requests(&self, domain: &str) -> Result<Value, BridgeError> {
        let data = self.send_command(
            "get_requests_by_domain",
            json!({ "domain": domain }),
            self.config.command_timeout(),
        )?;
        Self::require_success(&data)?;

        data.get("requests")
            .cloned()
            .ok_or_else(|| BridgeError::BadResponse("missing requests field".to_string()))
    }

    fn require_success(data: &Value) -> Result<(), BridgeError> {
        if data.get("success").and_then(Value::as_bool).unwrap_or(false) {
            Ok(())
        } else {
            Err(BridgeError::BadResponse(format!("peer reported failure: {data}")))
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop();
    }
}
