//! Relay event loop
//!
//! One thread owns the `mio::Poll`, both endpoint sockets and the `Session`,
//! so every session mutation is serialized here. Blocking negotiator calls
//! run on a separate worker thread that posts results back over a channel
//! and wakes the poll.
//!
//! ```text
//!   negotiation worker ──(StepOutcome + wake)──►┐
//!   server socket ────────(readable)───────────►│ relay thread ──► Session
//!   service socket ───────(readable)───────────►│
//!   Tunnel::stop ─────────(flag + wake)────────►┘
//! ```

use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use ring::rand::SystemRandom;

use crate::config::TunnelConfig;
use crate::endpoint::{self, MAX_DATAGRAM_SIZE};
use crate::error::{DisconnectReason, TunnelError};
use crate::events::EventSink;
use crate::metrics::Metrics;
use crate::negotiator::Negotiator;
use crate::packet::{Flag, HEADER_LEN};
use crate::session::{Action, Dropped, PacketKind, Session, SessionState};

// ============================================================================
// Constants
// ============================================================================

/// mio token for the server-facing socket
const SERVER_TOKEN: Token = Token(0);

/// mio token for the service-facing socket
const SERVICE_TOKEN: Token = Token(1);

/// mio token for negotiation results and stop requests
const WAKE_TOKEN: Token = Token(2);

/// Upper bound on a single poll wait
const MAX_POLL_WAIT: Duration = Duration::from_millis(100);

// ============================================================================
// Negotiation Worker
// ============================================================================

/// One blocking negotiator call
#[derive(Debug, Clone, Copy)]
enum Step {
    Probe,
    ResolvePublicAddress,
    NegotiatePort {
        server: IpAddr,
        public: IpAddr,
        client_port: u16,
    },
    RequestPeerDummy {
        server: IpAddr,
        public: IpAddr,
        client_port: u16,
    },
}

#[derive(Debug)]
enum StepOutcome {
    ProbeOk,
    PublicAddress(IpAddr),
    ServerPort(u16),
    PeerDummyRequested,
    Failed(TunnelError),
}

/// Runs negotiator calls one at a time on its own thread
///
/// The worker exits once the relay drops its request sender. A reply that
/// arrives after the relay is gone is discarded.
struct NegotiationWorker {
    requests: Sender<Step>,
    outcomes: Receiver<StepOutcome>,
    pending: bool,
}

impl NegotiationWorker {
    fn spawn(negotiator: Box<dyn Negotiator>, waker: Arc<Waker>) -> io::Result<Self> {
        let (requests, request_rx) = mpsc::channel::<Step>();
        let (outcome_tx, outcomes) = mpsc::channel();

        thread::Builder::new()
            .name("tunnel-negotiation".into())
            .spawn(move || {
                for step in request_rx {
                    let outcome = run_step(negotiator.as_ref(), step);
                    if outcome_tx.send(outcome).is_err() {
                        log::debug!("relay gone, discarding negotiation result");
                        break;
                    }
                    if let Err(e) = waker.wake() {
                        log::debug!("failed to wake relay: {:?}", e);
                    }
                }
            })?;

        Ok(Self {
            requests,
            outcomes,
            pending: false,
        })
    }

    fn request(&mut self, step: Step) -> bool {
        log::debug!("negotiation step: {:?}", step);
        self.pending = self.requests.send(step).is_ok();
        self.pending
    }

    fn try_recv(&mut self) -> Result<StepOutcome, TryRecvError> {
        let outcome = self.outcomes.try_recv();
        if outcome.is_ok() {
            self.pending = false;
        }
        outcome
    }
}

fn run_step(negotiator: &dyn Negotiator, step: Step) -> StepOutcome {
    let result = match step {
        Step::Probe => negotiator.probe().map(|()| StepOutcome::ProbeOk),
        Step::ResolvePublicAddress => negotiator
            .resolve_public_address()
            .map(StepOutcome::PublicAddress),
        Step::NegotiatePort {
            server,
            public,
            client_port,
        } => negotiator
            .negotiate_port(server, public, client_port)
            .map(StepOutcome::ServerPort),
        Step::RequestPeerDummy {
            server,
            public,
            client_port,
        } => negotiator
            .request_peer_dummy(server, public, client_port)
            .map(|()| StepOutcome::PeerDummyRequested),
    };
    result.unwrap_or_else(StepOutcome::Failed)
}

// ============================================================================
// Relay
// ============================================================================

pub(crate) struct Relay {
    /// mio poll instance
    poll: Poll,
    /// Socket facing the remote server (bound after the probe)
    server_socket: Option<UdpSocket>,
    /// Socket facing the local service (bound after the rendezvous)
    service_socket: Option<UdpSocket>,
    session: Session,
    negotiation: NegotiationWorker,
    /// When to ask the negotiator for the peer's dummy packet
    settle_deadline: Option<Instant>,
    server_address: IpAddr,
    settle_delay: Duration,
    stop: Arc<AtomicBool>,
    events: EventSink,
    metrics: Arc<Metrics>,
    rng: SystemRandom,
    recv_buf: Vec<u8>,
    /// Final event emitted and sockets closed
    finished: bool,
}

impl Relay {
    pub(crate) fn new(
        config: &TunnelConfig,
        negotiator: Box<dyn Negotiator>,
        stop: Arc<AtomicBool>,
        events: EventSink,
        metrics: Arc<Metrics>,
    ) -> Result<(Self, Arc<Waker>), TunnelError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let negotiation = NegotiationWorker::spawn(negotiator, Arc::clone(&waker))?;

        let relay = Relay {
            poll,
            server_socket: None,
            service_socket: None,
            session: Session::new(config),
            negotiation,
            settle_deadline: None,
            server_address: config.server_address,
            settle_delay: config.timings.settle_delay,
            stop,
            events,
            metrics,
            rng: SystemRandom::new(),
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            finished: false,
        };
        Ok((relay, waker))
    }

    /// Drive the session until it disconnects
    pub(crate) fn run(mut self) {
        self.session.start();
        self.emit(format!("testing negotiator at server {}", self.server_address));
        self.request(Step::Probe);

        let mut events = Events::with_capacity(64);

        while !self.session.is_terminated() {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let timeout = self.next_timeout(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.fail(DisconnectReason::IoError, format!("event loop error: {}", e));
                break;
            }

            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            for event in events.iter() {
                match event.token() {
                    SERVER_TOKEN => self.process_server_socket(),
                    SERVICE_TOKEN => self.process_service_socket(),
                    _ => {}
                }
                if self.session.is_terminated() {
                    break;
                }
            }

            self.process_negotiation();
            self.process_timers(Instant::now());
        }

        if !self.session.is_terminated() {
            self.session.stop();
        }
        self.finish("Service finished".to_string());
        log::debug!("relay loop exited in state {:?}", self.session.state());
    }

    fn next_timeout(&self, now: Instant) -> Duration {
        [self.settle_deadline, self.session.keepalive_deadline()]
            .iter()
            .flatten()
            .map(|at| at.saturating_duration_since(now))
            .min()
            .map_or(MAX_POLL_WAIT, |t| t.min(MAX_POLL_WAIT))
    }

    // ------------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------------

    fn request(&mut self, step: Step) {
        if !self.negotiation.request(step) {
            self.fail(
                DisconnectReason::IoError,
                "negotiation worker is not running".to_string(),
            );
        }
    }

    fn process_negotiation(&mut self) {
        while !self.session.is_terminated() {
            match self.negotiation.try_recv() {
                Ok(outcome) => self.on_step_outcome(outcome),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.negotiation.pending {
                        self.fail(
                            DisconnectReason::IoError,
                            "negotiation worker exited".to_string(),
                        );
                    }
                    break;
                }
            }
        }
    }

    fn on_step_outcome(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Failed(err) => {
                self.fail(err.disconnect_reason(), err.to_string());
            }
            StepOutcome::ProbeOk => {
                self.session.on_probe_ok();
                self.emit("negotiator ok".to_string());
                self.bind_server_socket();
                if !self.session.is_terminated() {
                    self.request(Step::ResolvePublicAddress);
                }
            }
            StepOutcome::PublicAddress(public) => {
                self.session.on_public_address(public);
                self.emit(format!("public IP: {}", public));
                if let Some(client_port) = self.session.client_port() {
                    self.request(Step::NegotiatePort {
                        server: self.server_address,
                        public,
                        client_port,
                    });
                }
            }
            StepOutcome::ServerPort(port) => {
                let now = Instant::now();
                let dummy = self.session.on_server_port(port, now);
                self.emit(format!("negotiated server port: {}", port));
                if let Some(action) = dummy {
                    self.execute(action);
                }
                if !self.session.is_terminated() {
                    self.settle_deadline = Some(now + self.settle_delay);
                }
            }
            StepOutcome::PeerDummyRequested => {
                self.emit("asked negotiator for the peer's dummy packet".to_string());
                self.bind_service_socket();
            }
        }
    }

    fn bind_server_socket(&mut self) {
        let bound = endpoint::bind_server_socket(&self.rng)
            .and_then(|socket| register(self.poll.registry(), socket, SERVER_TOKEN));

        match bound {
            Ok((socket, port)) => {
                self.session.on_client_bound(port);
                self.server_socket = Some(socket);
                self.emit(format!("client port selected: {}", port));
            }
            Err(source) => {
                let err = TunnelError::SocketBindFailed {
                    what: "server",
                    source,
                };
                self.fail(err.disconnect_reason(), err.to_string());
            }
        }
    }

    fn bind_service_socket(&mut self) {
        let port = self.session.service_port();
        let bound = endpoint::bind_service_socket(port)
            .and_then(|socket| register(self.poll.registry(), socket, SERVICE_TOKEN));

        match bound {
            Ok((socket, port)) => {
                self.service_socket = Some(socket);
                self.emit(format!("listening for service packets on port {}", port));
            }
            Err(source) => {
                let err = TunnelError::SocketBindFailed {
                    what: "service",
                    source,
                };
                self.fail(err.disconnect_reason(), err.to_string());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn process_timers(&mut self, now: Instant) {
        if self.session.is_terminated() {
            return;
        }

        if self.settle_deadline.map_or(false, |at| now >= at) {
            self.settle_deadline = None;
            if let (Some(public), Some(client_port)) =
                (self.session.public_address(), self.session.client_port())
            {
                self.request(Step::RequestPeerDummy {
                    server: self.server_address,
                    public,
                    client_port,
                });
            }
        }

        if let Some(silent_for) = self.session.on_keepalive_check(now) {
            self.finish(format!(
                "no packet from server for {} ms, keep-alive timeout",
                silent_for.as_millis()
            ));
        }
    }

    // ------------------------------------------------------------------------
    // Socket Processing
    // ------------------------------------------------------------------------

    fn process_server_socket(&mut self) {
        loop {
            let socket = match self.server_socket.as_ref() {
                Some(s) => s,
                None => return,
            };

            let (len, from) = match socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_transient(&e) => continue,
                Err(e) => {
                    log::debug!("server socket error: {:?}", e);
                    break;
                }
            };

            log::trace!("received {} bytes from {}", len, from);

            let before = self.session.state();
            let result = self
                .session
                .on_server_packet(from, &self.recv_buf[..len], Instant::now());

            match result {
                Ok(Some(action)) => self.execute(action),
                Ok(None) => {}
                Err(reason) => self.dropped(reason, from, len),
            }

            if before != SessionState::Connected && self.session.state() == SessionState::Connected
            {
                self.emit("received dummy packet from server, tunnel connected".to_string());
            }

            if self.session.is_terminated() {
                return;
            }
        }
    }

    fn process_service_socket(&mut self) {
        loop {
            let socket = match self.service_socket.as_ref() {
                Some(s) => s,
                None => return,
            };

            let (len, from) = match socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_transient(&e) => continue,
                Err(e) => {
                    log::debug!("service socket error: {:?}", e);
                    break;
                }
            };

            log::trace!("received {} bytes from local service at {}", len, from);

            let previous_peer = self.session.remote_peer();
            let result = self.session.on_service_packet(from, &self.recv_buf[..len]);

            match previous_peer {
                None => log::debug!("service peer is {}", from),
                Some(peer) if peer != from => log::info!("service peer changed to {}", from),
                Some(_) => {}
            }

            match result {
                Ok(actions) => {
                    for action in actions {
                        self.execute(action);
                        if self.session.is_terminated() {
                            return;
                        }
                    }
                }
                Err(reason) => self.dropped(reason, from, len),
            }
        }
    }

    fn dropped(&self, reason: Dropped, from: std::net::SocketAddr, len: usize) {
        self.metrics.record_dropped();
        match reason {
            Dropped::ForeignSource => {
                log::trace!("discarding {} bytes from unknown source {}", len, from)
            }
            Dropped::Malformed => log::trace!("discarding malformed packet from {}", from),
            Dropped::NoPeer => log::debug!("no service peer yet, dropping data packet"),
            Dropped::Ignored(flag) => log::trace!("ignoring packet with flag {}", flag),
            Dropped::NoServerPort => log::debug!("server port unknown, dropping service packet"),
            Dropped::Terminated => {}
        }
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    fn execute(&mut self, action: Action) {
        match action {
            Action::SendToServer { to, packet, kind } => {
                let result = match self.server_socket.as_ref() {
                    Some(socket) => endpoint::send_datagram(socket, &packet, to),
                    None => Err(closed_socket()),
                };

                match kind {
                    PacketKind::Data => match result {
                        Ok(()) => self
                            .metrics
                            .record_to_server(packet.len().saturating_sub(HEADER_LEN)),
                        Err(e) => {
                            log::debug!("error sending data packet to server: {}", e);
                            self.metrics.record_dropped();
                        }
                    },
                    PacketKind::Control(flag) => self.on_control_sent(flag, result),
                }
            }
            Action::SendToService { to, payload } => {
                let result = match self.service_socket.as_ref() {
                    Some(socket) => endpoint::send_datagram(socket, &payload, to),
                    None => Err(closed_socket()),
                };

                match result {
                    Ok(()) => self.metrics.record_to_service(payload.len()),
                    Err(e) => {
                        log::debug!("error sending data packet to service: {}", e);
                        self.metrics.record_dropped();
                    }
                }
            }
        }
    }

    fn on_control_sent(&mut self, flag: Flag, result: io::Result<()>) {
        let ended = self.session.on_control_sent(flag, &result);

        match result {
            Ok(()) => match flag {
                Flag::Dummy => self.emit("sent dummy packet to server".to_string()),
                Flag::Announce => self.emit("sent announcement packet to server".to_string()),
                Flag::KeepaliveAck => {
                    self.metrics.record_keepalive_ack();
                    log::trace!("acknowledged server keep-alive");
                }
                _ => {}
            },
            Err(source) => {
                let err = TunnelError::SocketSendFailed {
                    kind: flag.name(),
                    source,
                };
                if ended {
                    self.finish(err.to_string());
                } else {
                    log::warn!("{}", err);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------------

    fn fail(&mut self, reason: DisconnectReason, message: String) {
        self.session.fail(reason);
        self.finish(message);
    }

    /// Close both sockets and report the final state, once
    fn finish(&mut self, message: String) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.settle_deadline = None;

        for (socket, what) in [
            (self.server_socket.take(), "server"),
            (self.service_socket.take(), "service"),
        ] {
            if let Some(mut socket) = socket {
                if let Err(e) = self.poll.registry().deregister(&mut socket) {
                    log::debug!("failed to deregister {} socket: {:?}", what, e);
                }
            }
        }

        let state = self.session.state();
        match state {
            SessionState::Disconnected(reason) => {
                self.events.emit(state, format!("{} ({})", message, reason))
            }
            _ => self.events.emit(state, message),
        }
    }

    fn emit(&self, message: String) {
        self.events.emit(self.session.state(), message);
    }
}

/// Register a freshly bound socket and report its port
fn register(
    registry: &Registry,
    mut socket: UdpSocket,
    token: Token,
) -> io::Result<(UdpSocket, u16)> {
    registry.register(&mut socket, token, Interest::READABLE)?;
    let port = socket.local_addr()?.port();
    Ok((socket, port))
}

/// ICMP errors surfaced on some platforms; more datagrams may be queued
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

fn closed_socket() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket closed")
}
