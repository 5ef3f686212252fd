//! Relay session state machine
//!
//! The session owns every piece of mutable tunnel state and is only ever
//! touched from the relay thread. Each method is one transition: it takes an
//! event, updates the state and returns the packets the relay must send.
//! Socket I/O stays in the relay.
//!
//! # State Machine
//!
//! ```text
//! Idle → TestingNegotiator → Negotiating → AwaitingDummyAck → Connected
//!            │                   │                │               │
//!            └───────────────────┴────────────────┴───────────────┴──► Disconnected(reason)
//! ```
//!
//! `Disconnected` is terminal: every transition is a no-op once reached.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::config::TunnelConfig;
use crate::error::DisconnectReason;
use crate::keepalive::{KeepAliveSupervisor, KeepAliveVerdict};
use crate::packet::{self, Flag, PortByteOrder};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TestingNegotiator,
    Negotiating,
    AwaitingDummyAck,
    Connected,
    Disconnected(DisconnectReason),
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected(_))
    }
}

/// Whether a failed send may end the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Control(Flag),
    Data,
}

/// Packet the relay must send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send on the server-facing socket
    SendToServer {
        to: SocketAddr,
        packet: Vec<u8>,
        kind: PacketKind,
    },
    /// Send on the service-facing socket
    SendToService { to: SocketAddr, payload: Vec<u8> },
}

/// Why an inbound packet produced nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dropped {
    /// Source address is not the configured server
    ForeignSource,
    /// Shorter than the tunnel header
    Malformed,
    /// DATA arrived before the service peer was observed
    NoPeer,
    /// Flag the client does not act on
    Ignored(u8),
    /// Packet needs the server port, which is not known yet
    NoServerPort,
    /// Session already ended
    Terminated,
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    server_address: IpAddr,
    service_port: u16,
    port_order: PortByteOrder,
    /// Server-facing socket port chosen on bind
    client_port: Option<u16>,
    /// Relay port learned from the negotiator
    server_port: Option<u16>,
    public_address: Option<IpAddr>,
    /// Source of the latest packet from the local service
    remote_peer: Option<SocketAddr>,
    /// Last packet accepted from the server
    last_activity: Option<Instant>,
    announced: bool,
    supervisor: KeepAliveSupervisor,
}

impl Session {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            state: SessionState::Idle,
            server_address: config.server_address,
            service_port: config.service_port,
            port_order: config.port_byte_order,
            client_port: None,
            server_port: None,
            public_address: None,
            remote_peer: None,
            last_activity: None,
            announced: false,
            supervisor: KeepAliveSupervisor::new(
                config.timings.keepalive_interval,
                config.timings.keepalive_timeout,
            ),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn client_port(&self) -> Option<u16> {
        self.client_port
    }

    pub fn server_port(&self) -> Option<u16> {
        self.server_port
    }

    pub fn public_address(&self) -> Option<IpAddr> {
        self.public_address
    }

    pub fn remote_peer(&self) -> Option<SocketAddr> {
        self.remote_peer
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    pub fn announced(&self) -> bool {
        self.announced
    }

    pub fn service_port(&self) -> u16 {
        self.service_port
    }

    /// Next keep-alive check, for poll timeout calculation
    pub fn keepalive_deadline(&self) -> Option<Instant> {
        self.supervisor.deadline()
    }

    /// Relay endpoint once the server port is known
    pub fn server_endpoint(&self) -> Option<SocketAddr> {
        self.server_port
            .map(|port| SocketAddr::new(self.server_address, port))
    }

    // ------------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------------

    /// Idle → TestingNegotiator
    pub fn start(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::TestingNegotiator;
        }
    }

    /// TestingNegotiator → Negotiating
    pub fn on_probe_ok(&mut self) {
        if self.state == SessionState::TestingNegotiator {
            self.state = SessionState::Negotiating;
        }
    }

    pub fn on_client_bound(&mut self, port: u16) {
        if !self.is_terminated() {
            self.client_port = Some(port);
        }
    }

    pub fn on_public_address(&mut self, address: IpAddr) {
        if !self.is_terminated() {
            self.public_address = Some(address);
        }
    }

    /// Negotiating → AwaitingDummyAck; returns the DUMMY to send
    pub fn on_server_port(&mut self, port: u16, now: Instant) -> Option<Action> {
        if self.state != SessionState::Negotiating {
            return None;
        }

        self.server_port = Some(port);
        self.state = SessionState::AwaitingDummyAck;
        self.supervisor.arm(now);

        Some(Action::SendToServer {
            to: SocketAddr::new(self.server_address, port),
            packet: packet::control(Flag::Dummy),
            kind: PacketKind::Control(Flag::Dummy),
        })
    }

    // ------------------------------------------------------------------------
    // Inbound packets
    // ------------------------------------------------------------------------

    /// Packet received on the server-facing socket
    pub fn on_server_packet(
        &mut self,
        from: SocketAddr,
        raw: &[u8],
        now: Instant,
    ) -> Result<Option<Action>, Dropped> {
        if self.is_terminated() {
            return Err(Dropped::Terminated);
        }
        // Source address is the only authentication the protocol has
        if from.ip() != self.server_address {
            return Err(Dropped::ForeignSource);
        }

        let (flag, payload) = packet::parse(raw).map_err(|_| Dropped::Malformed)?;

        match Flag::from_byte(flag) {
            Some(Flag::Dummy) => {
                self.last_activity = Some(now);
                if self.state == SessionState::AwaitingDummyAck {
                    self.state = SessionState::Connected;
                }
                Ok(None)
            }
            Some(Flag::ServerKeepalive) => {
                self.last_activity = Some(now);
                let to = self.server_endpoint().unwrap_or(from);
                Ok(Some(Action::SendToServer {
                    to,
                    packet: packet::control(Flag::KeepaliveAck),
                    kind: PacketKind::Control(Flag::KeepaliveAck),
                }))
            }
            Some(Flag::Data) => {
                self.last_activity = Some(now);
                let to = self.remote_peer.ok_or(Dropped::NoPeer)?;
                Ok(Some(Action::SendToService {
                    to,
                    payload: payload.to_vec(),
                }))
            }
            _ => Err(Dropped::Ignored(flag)),
        }
    }

    /// Packet received on the service-facing socket
    ///
    /// The first packet triggers the ANNOUNCE; every packet, the first one
    /// included, is then forwarded to the server with a DATA header.
    pub fn on_service_packet(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
    ) -> Result<Vec<Action>, Dropped> {
        if self.is_terminated() {
            return Err(Dropped::Terminated);
        }
        let to = self.server_endpoint().ok_or(Dropped::NoServerPort)?;

        // Last writer wins: one local peer at a time
        self.remote_peer = Some(from);

        let mut actions = Vec::with_capacity(2);
        if !self.announced {
            actions.push(Action::SendToServer {
                to,
                packet: packet::announce(self.port_order, self.service_port),
                kind: PacketKind::Control(Flag::Announce),
            });
        }
        actions.push(Action::SendToServer {
            to,
            packet: packet::frame(packet::FLAG_DATA, payload),
            kind: PacketKind::Data,
        });

        Ok(actions)
    }

    // ------------------------------------------------------------------------
    // Send results
    // ------------------------------------------------------------------------

    /// Outcome of a control packet send
    ///
    /// DUMMY and ANNOUNCE failures end the session; KEEPALIVE_ACK is best
    /// effort. Returns true when the session ended here.
    pub fn on_control_sent(&mut self, flag: Flag, result: &io::Result<()>) -> bool {
        if self.is_terminated() {
            return false;
        }

        match (flag, result) {
            (Flag::Announce, Ok(())) => {
                self.announced = true;
                if self.state != SessionState::Connected {
                    self.state = SessionState::Connected;
                }
                false
            }
            (Flag::Dummy, Err(_)) | (Flag::Announce, Err(_)) => {
                self.fail(DisconnectReason::SocketSendFailed);
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------------
    // Supervision and termination
    // ------------------------------------------------------------------------

    /// Run the keep-alive check if due; returns the silence when it fired
    pub fn on_keepalive_check(&mut self, now: Instant) -> Option<Duration> {
        if self.is_terminated() {
            return None;
        }

        match self.supervisor.poll(now, self.last_activity) {
            KeepAliveVerdict::TimedOut { silent_for } => {
                self.fail(DisconnectReason::KeepAliveTimeout);
                Some(silent_for)
            }
            KeepAliveVerdict::Alive | KeepAliveVerdict::NotDue => None,
        }
    }

    /// Any state → Disconnected(reason); the first cause sticks
    pub fn fail(&mut self, reason: DisconnectReason) {
        if self.is_terminated() {
            return;
        }
        self.supervisor.disarm();
        self.state = SessionState::Disconnected(reason);
    }

    pub fn stop(&mut self) {
        self.fail(DisconnectReason::UserRequested);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;

    const SERVER_PORT: u16 = 51820;
    const SERVICE_PORT: u16 = 8080;

    fn server_ip() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    fn server_addr() -> SocketAddr {
        SocketAddr::new(server_ip(), SERVER_PORT)
    }

    fn config() -> TunnelConfig {
        TunnelConfig::new(server_ip(), "http://negotiator.test", SERVICE_PORT).with_timings(
            Timings {
                keepalive_interval: Duration::from_secs(15),
                keepalive_timeout: Duration::from_millis(15_000),
                ..Timings::default()
            },
        )
    }

    /// Session driven up to AwaitingDummyAck
    fn awaiting(now: Instant) -> Session {
        let mut session = Session::new(&config());
        session.start();
        session.on_probe_ok();
        session.on_client_bound(40000);
        session.on_public_address("198.51.100.1".parse().unwrap());
        let dummy = session.on_server_port(SERVER_PORT, now);
        assert!(dummy.is_some());
        session
    }

    fn connected(now: Instant) -> Session {
        let mut session = awaiting(now);
        session.on_server_packet(server_addr(), &[1, 0], now).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        session
    }

    #[test]
    fn test_negotiation_transitions() {
        let now = Instant::now();
        let mut session = Session::new(&config());
        assert_eq!(session.state(), SessionState::Idle);

        session.start();
        assert_eq!(session.state(), SessionState::TestingNegotiator);

        // Server port before probe is ignored
        assert!(session.on_server_port(SERVER_PORT, now).is_none());

        session.on_probe_ok();
        assert_eq!(session.state(), SessionState::Negotiating);

        let action = session.on_server_port(SERVER_PORT, now).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingDummyAck);
        assert_eq!(
            action,
            Action::SendToServer {
                to: server_addr(),
                packet: vec![1, 0],
                kind: PacketKind::Control(Flag::Dummy),
            }
        );
        assert!(session.keepalive_deadline().is_some());
        assert!(session.last_activity().is_none());
    }

    #[test]
    fn test_dummy_connects_and_starts_clock() {
        let now = Instant::now();
        let mut session = awaiting(now);
        let later = now + Duration::from_millis(200);
        let out = session.on_server_packet(server_addr(), &[1, 0], later).unwrap();
        assert!(out.is_none());
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.last_activity(), Some(later));
    }

    #[test]
    fn test_dummy_from_other_port_of_server_is_accepted() {
        let now = Instant::now();
        let mut session = awaiting(now);
        let from = SocketAddr::new(server_ip(), 1234);
        session.on_server_packet(from, &[1, 0], now).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_foreign_source_never_affects_session() {
        let now = Instant::now();
        let mut session = awaiting(now);
        session.on_service_packet("127.0.0.1:6000".parse().unwrap(), &[1]).unwrap();
        let peer = session.remote_peer();
        let state = session.state();

        let stranger: SocketAddr = "192.0.2.99:51820".parse().unwrap();
        let packets: [&[u8]; 5] = [&[1, 0], &[2, 0], &[0, 0, 7, 7], &[4, 0, 1, 2], &[]];
        for raw in packets {
            assert_eq!(
                session.on_server_packet(stranger, raw, now),
                Err(Dropped::ForeignSource)
            );
        }
        assert_eq!(session.last_activity(), None);
        assert_eq!(session.remote_peer(), peer);
        assert_eq!(session.state(), state);
    }

    #[test]
    fn test_keepalive_always_acked_once() {
        let now = Instant::now();
        let mut session = awaiting(now);

        for _ in 0..3 {
            let action = session.on_server_packet(server_addr(), &[2, 0], now).unwrap();
            assert_eq!(
                action,
                Some(Action::SendToServer {
                    to: server_addr(),
                    packet: vec![5, 0],
                    kind: PacketKind::Control(Flag::KeepaliveAck),
                })
            );
        }
        // Keep-alive refreshes activity but does not connect
        assert_eq!(session.state(), SessionState::AwaitingDummyAck);
        assert_eq!(session.last_activity(), Some(now));
    }

    #[test]
    fn test_keepalive_from_other_port_acked_to_negotiated_port() {
        let now = Instant::now();
        let mut session = connected(now);
        let from = SocketAddr::new(server_ip(), 9999);
        match session.on_server_packet(from, &[2, 0], now).unwrap() {
            Some(Action::SendToServer { to, .. }) => assert_eq!(to, server_addr()),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_keepalive_ack_failure_is_not_fatal() {
        let now = Instant::now();
        let mut session = connected(now);
        let err = Err(io::Error::new(io::ErrorKind::Other, "no route"));
        assert!(!session.on_control_sent(Flag::KeepaliveAck, &err));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_data_without_peer_is_dropped() {
        let now = Instant::now();
        let mut session = connected(now);
        assert_eq!(
            session.on_server_packet(server_addr(), &[0, 0, 1, 2, 3], now),
            Err(Dropped::NoPeer)
        );
        assert_eq!(session.last_activity(), Some(now));
    }

    #[test]
    fn test_data_forwarded_to_peer() {
        let now = Instant::now();
        let mut session = connected(now);
        let peer: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        session.on_service_packet(peer, &[9]).unwrap();

        let action = session.on_server_packet(server_addr(), &[0, 0, 1, 2, 3], now).unwrap();
        assert_eq!(
            action,
            Some(Action::SendToService {
                to: peer,
                payload: vec![1, 2, 3],
            })
        );
    }

    #[test]
    fn test_malformed_and_unknown_flags_dropped() {
        let now = Instant::now();
        let mut session = awaiting(now);
        assert_eq!(
            session.on_server_packet(server_addr(), &[1], now),
            Err(Dropped::Malformed)
        );
        assert_eq!(
            session.on_server_packet(server_addr(), &[3, 0], now),
            Err(Dropped::Ignored(3))
        );
        assert_eq!(
            session.on_server_packet(server_addr(), &[5, 0], now),
            Err(Dropped::Ignored(5))
        );
        assert_eq!(session.state(), SessionState::AwaitingDummyAck);
        assert_eq!(session.last_activity(), None);
    }

    #[test]
    fn test_first_service_packet_announces_once() {
        let now = Instant::now();
        let mut session = awaiting(now);
        let peer: SocketAddr = "127.0.0.1:6000".parse().unwrap();

        let actions = session.on_service_packet(peer, &[9, 9, 9]).unwrap();
        assert_eq!(
            actions,
            vec![
                Action::SendToServer {
                    to: server_addr(),
                    packet: vec![4, 0, 0x1f, 0x90],
                    kind: PacketKind::Control(Flag::Announce),
                },
                Action::SendToServer {
                    to: server_addr(),
                    packet: vec![0, 0, 9, 9, 9],
                    kind: PacketKind::Data,
                },
            ]
        );
        assert_eq!(session.remote_peer(), Some(peer));

        assert!(!session.on_control_sent(Flag::Announce, &Ok(())));
        assert!(session.announced());
        assert_eq!(session.state(), SessionState::Connected);

        let actions = session.on_service_packet(peer, &[7]).unwrap();
        assert_eq!(
            actions,
            vec![Action::SendToServer {
                to: server_addr(),
                packet: vec![0, 0, 7],
                kind: PacketKind::Data,
            }]
        );
    }

    #[test]
    fn test_legacy_announce_byte_order() {
        let now = Instant::now();
        let cfg = config().with_port_byte_order(PortByteOrder::LittleEndian);
        let mut session = Session::new(&cfg);
        session.start();
        session.on_probe_ok();
        session.on_server_port(SERVER_PORT, now);
        let actions = session
            .on_service_packet("127.0.0.1:6000".parse().unwrap(), &[])
            .unwrap();
        match &actions[0] {
            Action::SendToServer { packet, .. } => assert_eq!(packet, &vec![4, 0, 0x90, 0x1f]),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_announce_failure_is_fatal() {
        let now = Instant::now();
        let mut session = awaiting(now);
        session.on_service_packet("127.0.0.1:6000".parse().unwrap(), &[1]).unwrap();
        let err = Err(io::Error::new(io::ErrorKind::Other, "unreachable"));
        assert!(session.on_control_sent(Flag::Announce, &err));
        assert_eq!(
            session.state(),
            SessionState::Disconnected(DisconnectReason::SocketSendFailed)
        );
        assert!(!session.announced());
    }

    #[test]
    fn test_dummy_failure_is_fatal() {
        let now = Instant::now();
        let mut session = awaiting(now);
        let err = Err(io::Error::new(io::ErrorKind::Other, "unreachable"));
        assert!(session.on_control_sent(Flag::Dummy, &err));
        assert!(session.is_terminated());
    }

    #[test]
    fn test_peer_last_writer_wins() {
        let now = Instant::now();
        let mut session = connected(now);
        let first: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let second: SocketAddr = "127.0.0.1:6001".parse().unwrap();
        session.on_service_packet(first, &[1]).unwrap();
        session.on_control_sent(Flag::Announce, &Ok(()));
        session.on_service_packet(second, &[2]).unwrap();
        assert_eq!(session.remote_peer(), Some(second));
    }

    #[test]
    fn test_service_packet_needs_server_port() {
        let mut session = Session::new(&config());
        session.start();
        session.on_probe_ok();
        assert_eq!(
            session.on_service_packet("127.0.0.1:6000".parse().unwrap(), &[1]),
            Err(Dropped::NoServerPort)
        );
        assert_eq!(session.remote_peer(), None);
    }

    #[test]
    fn test_keepalive_timeout_fires_once() {
        let start = Instant::now();
        let mut session = connected(start);

        // Remote sends keep-alives every 5s for a while
        let mut now = start;
        for _ in 0..6 {
            now += Duration::from_secs(5);
            session.on_server_packet(server_addr(), &[2, 0], now).unwrap();
            assert!(session.on_keepalive_check(now).is_none());
        }
        assert_eq!(session.state(), SessionState::Connected);

        // Then 16s of silence, checked on the next due ticks
        let silence_start = now;
        let mut fired = 0;
        for step in 1..=8 {
            let t = silence_start + Duration::from_secs(5 * step);
            if session.on_keepalive_check(t).is_some() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(
            session.state(),
            SessionState::Disconnected(DisconnectReason::KeepAliveTimeout)
        );
    }

    #[test]
    fn test_no_timeout_before_first_server_packet() {
        let start = Instant::now();
        let mut session = awaiting(start);
        assert!(session
            .on_keepalive_check(start + Duration::from_secs(15))
            .is_none());
        assert_eq!(session.state(), SessionState::AwaitingDummyAck);
    }

    #[test]
    fn test_silent_server_after_dummy_times_out_once() {
        let start = Instant::now();
        let mut session = awaiting(start);

        let mut fired = 0;
        for step in 1..=20 {
            let t = start + Duration::from_secs(15 * step);
            if session.on_keepalive_check(t).is_some() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(
            session.state(),
            SessionState::Disconnected(DisconnectReason::KeepAliveTimeout)
        );
    }

    #[test]
    fn test_dummy_while_negotiating_does_not_connect() {
        let now = Instant::now();
        let mut session = Session::new(&config());
        session.start();
        session.on_probe_ok();

        assert_eq!(session.on_server_packet(server_addr(), &[1, 0], now), Ok(None));
        assert_eq!(session.state(), SessionState::Negotiating);
        assert_eq!(session.last_activity(), Some(now));
    }

    #[test]
    fn test_disconnected_is_terminal() {
        let now = Instant::now();
        let mut session = connected(now);
        session.stop();
        assert_eq!(
            session.state(),
            SessionState::Disconnected(DisconnectReason::UserRequested)
        );

        session.fail(DisconnectReason::KeepAliveTimeout);
        session.start();
        session.on_probe_ok();
        assert_eq!(
            session.state(),
            SessionState::Disconnected(DisconnectReason::UserRequested)
        );
        assert_eq!(
            session.on_server_packet(server_addr(), &[1, 0], now),
            Err(Dropped::Terminated)
        );
        assert_eq!(
            session.on_service_packet("127.0.0.1:6000".parse().unwrap(), &[1]),
            Err(Dropped::Terminated)
        );
        assert!(session.keepalive_deadline().is_none());
    }
}
