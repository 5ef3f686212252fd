//! Sneaky Tunnel core
//!
//! This crate provides the Rust core of the tunnel client, handling:
//! - Rendezvous with the negotiator over HTTP(S)
//! - UDP hole punching towards the remote relay
//! - Relaying packets between the relay and a local UDP service
//! - Keep-alive supervision of the punched path
//! - FFI interface for mobile host apps
//!
//! The host supplies a [`TunnelConfig`], calls [`Tunnel::start`], reads
//! [`TunnelEvent`]s until the session disconnects, and may call
//! [`Tunnel::stop`] at any time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::Waker;

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod ffi;
pub mod keepalive;
pub mod metrics;
pub mod negotiator;
pub mod packet;
pub mod session;

mod relay;

pub use config::{Timings, TunnelConfig};
pub use error::{DisconnectReason, TunnelError};
pub use events::{ConnectionStatus, TunnelEvent};
pub use metrics::Metrics;
pub use negotiator::{HttpNegotiator, Negotiator};
pub use packet::PortByteOrder;
pub use session::SessionState;

use events::EventSink;
use relay::Relay;

// ============================================================================
// Tunnel Handle
// ============================================================================

/// A running tunnel session
///
/// Each call to [`Tunnel::start`] negotiates a brand new session; a session
/// that reached `Disconnected` is never resumed.
pub struct Tunnel {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    events: Receiver<TunnelEvent>,
    metrics: Arc<Metrics>,
    thread: Option<JoinHandle<()>>,
}

impl Tunnel {
    /// Start a session using the HTTP negotiator
    pub fn start(config: TunnelConfig) -> Result<Self, TunnelError> {
        config.validate()?;
        let negotiator = HttpNegotiator::new(&config)?;
        Self::start_with(config, negotiator)
    }

    /// Start a session with a caller-provided negotiator
    pub fn start_with<N>(config: TunnelConfig, negotiator: N) -> Result<Self, TunnelError>
    where
        N: Negotiator + 'static,
    {
        config.validate()?;

        let (tx, events) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(Metrics::new());

        let (relay, waker) = Relay::new(
            &config,
            Box::new(negotiator),
            Arc::clone(&stop),
            EventSink::new(tx),
            Arc::clone(&metrics),
        )?;

        log::info!(
            "starting tunnel: server={} negotiator={} service_port={}",
            config.server_address,
            config.negotiator_url,
            config.service_port
        );

        let thread = thread::Builder::new()
            .name("tunnel-relay".into())
            .spawn(move || relay.run())?;

        Ok(Tunnel {
            stop,
            waker,
            events,
            metrics,
            thread: Some(thread),
        })
    }

    /// Ask the session to disconnect; safe to call repeatedly
    ///
    /// Returns immediately. In-flight negotiator calls are not awaited.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.waker.wake() {
            log::debug!("failed to wake relay for stop: {:?}", e);
        }
    }

    /// Status/log event stream
    pub fn events(&self) -> &Receiver<TunnelEvent> {
        &self.events
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Whether the relay thread is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Wait for the session to end
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("relay thread panicked");
            }
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
