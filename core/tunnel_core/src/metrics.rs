//! Relay counters
//!
//! Atomic counters shared between the relay thread and the host. Rendered in
//! Prometheus text exposition format on request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct Metrics {
    /// Packets relayed from the local service to the server (counter)
    pub to_server_packets_total: AtomicU64,
    /// Payload bytes relayed to the server (counter)
    pub to_server_bytes_total: AtomicU64,
    /// Packets relayed from the server to the local service (counter)
    pub to_service_packets_total: AtomicU64,
    /// Payload bytes relayed to the local service (counter)
    pub to_service_bytes_total: AtomicU64,
    /// KEEPALIVE_ACK packets sent (counter)
    pub keepalive_acks_total: AtomicU64,
    /// Inbound packets dropped: foreign source, malformed, no peer, send failure (counter)
    pub dropped_packets_total: AtomicU64,
    /// Session start time
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            to_server_packets_total: AtomicU64::new(0),
            to_server_bytes_total: AtomicU64::new(0),
            to_service_packets_total: AtomicU64::new(0),
            to_service_bytes_total: AtomicU64::new(0),
            keepalive_acks_total: AtomicU64::new(0),
            dropped_packets_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_to_server(&self, bytes: usize) {
        self.to_server_packets_total.fetch_add(1, Ordering::Relaxed);
        self.to_server_bytes_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_to_service(&self, bytes: usize) {
        self.to_service_packets_total.fetch_add(1, Ordering::Relaxed);
        self.to_service_bytes_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_keepalive_ack(&self) {
        self.keepalive_acks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_packets_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP sneaky_tunnel_to_server_packets_total Packets relayed to the server\n\
             # TYPE sneaky_tunnel_to_server_packets_total counter\n\
             sneaky_tunnel_to_server_packets_total {}\n\
             # HELP sneaky_tunnel_to_server_bytes_total Payload bytes relayed to the server\n\
             # TYPE sneaky_tunnel_to_server_bytes_total counter\n\
             sneaky_tunnel_to_server_bytes_total {}\n\
             # HELP sneaky_tunnel_to_service_packets_total Packets relayed to the local service\n\
             # TYPE sneaky_tunnel_to_service_packets_total counter\n\
             sneaky_tunnel_to_service_packets_total {}\n\
             # HELP sneaky_tunnel_to_service_bytes_total Payload bytes relayed to the local service\n\
             # TYPE sneaky_tunnel_to_service_bytes_total counter\n\
             sneaky_tunnel_to_service_bytes_total {}\n\
             # HELP sneaky_tunnel_keepalive_acks_total Keep-alive acknowledgements sent\n\
             # TYPE sneaky_tunnel_keepalive_acks_total counter\n\
             sneaky_tunnel_keepalive_acks_total {}\n\
             # HELP sneaky_tunnel_dropped_packets_total Packets dropped by the relay\n\
             # TYPE sneaky_tunnel_dropped_packets_total counter\n\
             sneaky_tunnel_dropped_packets_total {}\n\
             # HELP sneaky_tunnel_uptime_seconds Session uptime in seconds\n\
             # TYPE sneaky_tunnel_uptime_seconds gauge\n\
             sneaky_tunnel_uptime_seconds {}\n",
            self.to_server_packets_total.load(Ordering::Relaxed),
            self.to_server_bytes_total.load(Ordering::Relaxed),
            self.to_service_packets_total.load(Ordering::Relaxed),
            self.to_service_bytes_total.load(Ordering::Relaxed),
            self.keepalive_acks_total.load(Ordering::Relaxed),
            self.dropped_packets_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
