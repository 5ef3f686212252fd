//! C interface for host apps
//!
//! The host owns the UI and the platform lifecycle; it starts a tunnel,
//! drains events on its own schedule and stops the tunnel when asked.
//! Every entry point null-checks its pointers and never unwinds into C.

use std::ffi::CStr;
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::mpsc::TryRecvError;

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::events::ConnectionStatus;
use crate::Tunnel;

// ============================================================================
// FFI Types
// ============================================================================

/// Coarse tunnel status exposed to the host
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
}

impl From<ConnectionStatus> for TunnelStatus {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Connecting => TunnelStatus::Connecting,
            ConnectionStatus::Connected => TunnelStatus::Connected,
            ConnectionStatus::Disconnected => TunnelStatus::Disconnected,
        }
    }
}

/// Result codes for FFI operations
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiResult {
    Ok = 0,
    InvalidPointer = 1,
    PanicCaught = 2,
}

/// `tunnel_poll_event`: no event queued
pub const POLL_NO_EVENT: isize = -1;

/// `tunnel_poll_event`: bad arguments
pub const POLL_INVALID: isize = -2;

/// `tunnel_poll_event`: session over and all events drained
pub const POLL_CLOSED: isize = -3;

/// Tunnel plus the last status the host has been told about
pub struct FfiTunnel {
    tunnel: Tunnel,
    status: TunnelStatus,
}

// ============================================================================
// FFI Functions
// ============================================================================

/// Start a tunnel
///
/// Returns null if the arguments are invalid or the session could not start.
/// The caller must release the handle with `tunnel_destroy`.
///
/// # Safety
/// `server` and `negotiator` must be valid null-terminated C strings.
#[no_mangle]
pub unsafe extern "C" fn tunnel_start(
    server: *const libc::c_char,
    negotiator: *const libc::c_char,
    service_port: u16,
) -> *mut FfiTunnel {
    if server.is_null() || negotiator.is_null() {
        return ptr::null_mut();
    }

    let result = panic::catch_unwind(|| {
        let server = CStr::from_ptr(server).to_str().ok()?;
        let negotiator = CStr::from_ptr(negotiator).to_str().ok()?;
        let server: IpAddr = server.trim().parse().ok()?;

        let config = TunnelConfig::new(server, negotiator, service_port);
        Some(Tunnel::start(config))
    });

    match result {
        Ok(Some(started)) => into_handle(started),
        _ => ptr::null_mut(),
    }
}

/// Box a started tunnel for the host; null on failure
fn into_handle(started: Result<Tunnel, TunnelError>) -> *mut FfiTunnel {
    match started {
        Ok(tunnel) => Box::into_raw(Box::new(FfiTunnel {
            tunnel,
            status: TunnelStatus::Connecting,
        })),
        Err(e) => {
            log::warn!("tunnel_start failed: {}", e);
            ptr::null_mut()
        }
    }
}

/// Request the tunnel to stop; idempotent
///
/// # Safety
/// The pointer must come from `tunnel_start`.
#[no_mangle]
pub unsafe extern "C" fn tunnel_stop(tunnel: *const FfiTunnel) -> FfiResult {
    if tunnel.is_null() {
        return FfiResult::InvalidPointer;
    }

    panic::catch_unwind(AssertUnwindSafe(|| {
        (*tunnel).tunnel.stop();
        FfiResult::Ok
    }))
    .unwrap_or(FfiResult::PanicCaught)
}

/// Last status observed through `tunnel_poll_event`
///
/// # Safety
/// The pointer must come from `tunnel_start`.
#[no_mangle]
pub unsafe extern "C" fn tunnel_status(tunnel: *const FfiTunnel) -> TunnelStatus {
    if tunnel.is_null() {
        return TunnelStatus::Disconnected;
    }
    (*tunnel).status
}

/// Copy the next event message (UTF-8, not null-terminated) into `buf`
///
/// Returns the number of bytes written (truncated to `len`), or one of
/// `POLL_NO_EVENT`, `POLL_INVALID`, `POLL_CLOSED`.
///
/// # Safety
/// `buf` must be valid for `len` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn tunnel_poll_event(
    tunnel: *mut FfiTunnel,
    buf: *mut u8,
    len: libc::size_t,
) -> isize {
    if tunnel.is_null() || buf.is_null() {
        return POLL_INVALID;
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let handle = &mut *tunnel;
        match handle.tunnel.events().try_recv() {
            Ok(event) => {
                handle.status = event.status().into();
                let bytes = event.message.as_bytes();
                let n = bytes.len().min(len).min(isize::MAX as usize);
                ptr::copy_nonoverlapping(bytes.as_ptr(), buf, n);
                n as isize
            }
            Err(TryRecvError::Empty) => POLL_NO_EVENT,
            Err(TryRecvError::Disconnected) => POLL_CLOSED,
        }
    }));

    result.unwrap_or(POLL_INVALID)
}

/// Stop the tunnel and free the handle
///
/// # Safety
/// The pointer must come from `tunnel_start` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn tunnel_destroy(tunnel: *mut FfiTunnel) {
    if !tunnel.is_null() {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| {
            drop(Box::from_raw(tunnel));
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiator::HttpNegotiator;
    use std::ffi::CString;
    use std::time::{Duration, Instant};

    #[test]
    fn test_null_pointers() {
        unsafe {
            assert!(tunnel_start(ptr::null(), ptr::null(), 8080).is_null());
            assert_eq!(tunnel_stop(ptr::null()), FfiResult::InvalidPointer);
            assert_eq!(tunnel_status(ptr::null()), TunnelStatus::Disconnected);
            let mut buf = [0u8; 8];
            assert_eq!(
                tunnel_poll_event(ptr::null_mut(), buf.as_mut_ptr(), buf.len()),
                POLL_INVALID
            );
            tunnel_destroy(ptr::null_mut());
        }
    }

    #[test]
    fn test_invalid_arguments_rejected() {
        let bad_ip = CString::new("not-an-ip").unwrap();
        let negotiator = CString::new("http://127.0.0.1:1").unwrap();
        let server = CString::new("127.0.0.1").unwrap();
        let bad_url = CString::new("ftp://nowhere").unwrap();
        unsafe {
            assert!(tunnel_start(bad_ip.as_ptr(), negotiator.as_ptr(), 8080).is_null());
            assert!(tunnel_start(server.as_ptr(), bad_url.as_ptr(), 8080).is_null());
            assert!(tunnel_start(server.as_ptr(), negotiator.as_ptr(), 0).is_null());
        }
    }

    #[test]
    fn test_unreachable_negotiator_disconnects() {
        // Nothing listens on a freshly released TCP port
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = TunnelConfig::new(
            "127.0.0.1".parse().unwrap(),
            format!("http://127.0.0.1:{}", port),
            40123,
        );
        // Direct connection regardless of proxy settings in the environment
        let client = reqwest::blocking::Client::builder()
            .no_proxy()
            .build()
            .unwrap();
        let negotiator = HttpNegotiator::with_client(&config, client);

        unsafe {
            let tunnel = into_handle(Tunnel::start_with(config, negotiator));
            assert!(!tunnel.is_null());
            assert_eq!(tunnel_status(tunnel), TunnelStatus::Connecting);

            let mut buf = [0u8; 256];
            let deadline = Instant::now() + Duration::from_secs(10);
            while tunnel_status(tunnel) != TunnelStatus::Disconnected {
                assert!(Instant::now() < deadline, "tunnel never disconnected");
                if tunnel_poll_event(tunnel, buf.as_mut_ptr(), buf.len()) == POLL_NO_EVENT {
                    std::thread::sleep(Duration::from_millis(10));
                }
            }

            assert_eq!(tunnel_stop(tunnel), FfiResult::Ok);
            assert_eq!(tunnel_stop(tunnel), FfiResult::Ok);
            tunnel_destroy(tunnel);
        }
    }
}
