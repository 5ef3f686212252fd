//! Sneaky Tunnel client
//!
//! Command-line host for the tunnel core:
//! - Loads the session config from a JSON file or from flags
//! - Starts one tunnel session and prints its events
//! - Stops cleanly on SIGINT/SIGTERM

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use signal_hook::consts::{SIGINT, SIGTERM};
use tunnel_core::{PortByteOrder, SessionState, Tunnel, TunnelConfig, TunnelEvent};

// ============================================================================
// Constants
// ============================================================================

/// How often the main thread checks for a shutdown signal
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(200);

const USAGE: &str = "usage: sneaky-tunnel (--config <file.json> | --server <ip> --negotiator <url> --service-port <port>) [--public-ip-url <url>] [--legacy-port-order] [--metrics]";

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    // --config <path>          JSON session config
    // --server <ip>            Remote relay address
    // --negotiator <url>       Negotiator base URL
    // --service-port <port>    Local UDP service port
    // --public-ip-url <url>    Public IP lookup endpoint (optional)
    // --legacy-port-order      Announce the service port low byte first
    // --metrics                Print counters when the session ends

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = config_from_args(&args)?;
    let show_metrics = has_flag(&args, "--metrics");

    log::info!("Sneaky Tunnel client starting...");
    log::info!("  Server:       {}", config.server_address);
    log::info!("  Negotiator:   {}", config.negotiator_url);
    log::info!("  Service port: {}", config.service_port);
    log::info!("  Port order:   {:?}", config.port_byte_order);

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    let tunnel = Tunnel::start(config)?;
    let metrics = tunnel.metrics();
    let mut final_state = None;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            tunnel.stop();
        }

        match tunnel.events().recv_timeout(SIGNAL_POLL_INTERVAL) {
            Ok(event) => {
                println!("{}", format_event(&event));
                if event.state.is_terminal() {
                    final_state = Some(event.state);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tunnel.join();

    if show_metrics {
        print!("{}", metrics.render());
    }

    match final_state {
        Some(SessionState::Disconnected(reason)) if reason.is_error() => {
            Err(format!("tunnel disconnected: {}", reason).into())
        }
        _ => Ok(()),
    }
}

// ============================================================================
// Argument Handling
// ============================================================================

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Build the session config; `--config` wins, flags override single fields
fn config_from_args(args: &[String]) -> Result<TunnelConfig, Box<dyn std::error::Error>> {
    let mut config = match parse_arg(args, "--config") {
        Some(path) => TunnelConfig::load(&path)?,
        None => {
            let server = parse_arg(args, "--server").ok_or(USAGE)?;
            let negotiator = parse_arg(args, "--negotiator").ok_or(USAGE)?;
            let service_port = parse_arg(args, "--service-port").ok_or(USAGE)?;

            let server: IpAddr = server.parse().map_err(|_| "Invalid server address")?;
            let service_port: u16 = service_port
                .parse()
                .map_err(|_| "Invalid service port")?;

            TunnelConfig::new(server, negotiator, service_port)
        }
    };

    if let Some(url) = parse_arg(args, "--public-ip-url") {
        config = config.with_public_ip_url(url);
    }
    if has_flag(args, "--legacy-port-order") {
        config = config.with_port_byte_order(PortByteOrder::LittleEndian);
    }

    config.validate()?;
    Ok(config)
}

fn format_event(event: &TunnelEvent) -> String {
    let secs = event
        .timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    format!("[{:.3}] [{:?}] {}", secs, event.status(), event.message)
}
