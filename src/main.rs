//! Extbridge daemon - hosts the local command bridge for a browser
//! extension.
//!
//! This is the binary entry point. See the `extbridge` library for the
//! bridge itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use extbridge::{Bridge, BridgeConfig};

/// Local socket bridge between desktop tooling and a browser-extension peer.
#[derive(Parser, Debug)]
#[command(name = "extbridge", version, about)]
struct Cli {
    /// Host the bridge listens on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port the bridge listens on (0 picks an ephemeral port).
    #[arg(long, default_value_t = 9223)]
    port: u16,

    /// Seconds to wait for a command response.
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = BridgeConfig {
        host: cli.host,
        port: cli.port,
        command_timeout_secs: cli.timeout,
    };

    let bridge = Bridge::new(config);
    bridge.start()?;
    if let Some(addr) = bridge.local_addr() {
        println!("Bridge listening on {addr}");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    println!("Shutting down...");
    bridge.stop();
    Ok(())
}
