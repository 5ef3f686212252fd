//! Endpoint sockets
//!
//! Two independent non-blocking UDP sockets:
//! - the server-facing socket, bound to a random port in `CLIENT_PORT_RANGE`
//!   right after the negotiator probe succeeds
//! - the service-facing socket, bound to the configured service port once
//!   the rendezvous is complete

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;

use mio::net::UdpSocket;
use ring::rand::{SecureRandom, SystemRandom};

/// Ports the server-facing socket may bind to
pub const CLIENT_PORT_RANGE: RangeInclusive<u16> = 5000..=65535;

/// Random ports tried before giving up
const BIND_ATTEMPTS: usize = 16;

/// Largest datagram the relay handles
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Pick a random port from `CLIENT_PORT_RANGE`
pub fn random_client_port(rng: &SystemRandom) -> io::Result<u16> {
    let mut bytes = [0u8; 2];
    rng.fill(&mut bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "random source unavailable"))?;

    let start = u32::from(*CLIENT_PORT_RANGE.start());
    let span = u32::from(*CLIENT_PORT_RANGE.end()) - start + 1;
    let port = start + u32::from(u16::from_be_bytes(bytes)) % span;
    Ok(port as u16)
}

/// Bind the server-facing socket on a random port in `CLIENT_PORT_RANGE`
///
/// The bind is a single blocking call, so the port is known as soon as it
/// returns.
pub fn bind_server_socket(rng: &SystemRandom) -> io::Result<UdpSocket> {
    let mut last_err = None;

    for _ in 0..BIND_ATTEMPTS {
        let port = random_client_port(rng)?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        match UdpSocket::bind(addr) {
            Ok(socket) => return Ok(socket),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                log::debug!("client port {} in use, retrying", port);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no free client port")))
}

/// Bind the service-facing socket on `port` (all interfaces)
pub fn bind_service_socket(port: u16) -> io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
}

/// Send one whole datagram
///
/// Never retried: a full send buffer is reported as a failure and the
/// caller decides whether that is fatal.
pub fn send_datagram(socket: &UdpSocket, buf: &[u8], to: SocketAddr) -> io::Result<()> {
    let sent = socket.send_to(buf, to)?;
    if sent != buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short send: {} of {} bytes", sent, buf.len()),
        ));
    }
    Ok(())
}
