//! Tunnel configuration
//!
//! A `TunnelConfig` is supplied by the host at session start and stays
//! immutable for the lifetime of that session. It can be built directly or
//! read from the JSON record older clients persisted
//! (`{"serverIP": "...", "negotiator": "...", "servicePort": "..."}`).

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::TunnelError;
use crate::packet::PortByteOrder;

// ============================================================================
// Constants
// ============================================================================

/// Default public-IP resolver (plain-text IPv4 body)
pub const DEFAULT_PUBLIC_IP_URL: &str = "https://api.ipify.org";

/// Keep-alive check interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Silence longer than this ends the session
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Delay between the local DUMMY and asking the relay for the peer's dummy
pub const SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Upper bound for a single negotiator/resolver request
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Timings
// ============================================================================

/// Protocol timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub settle_delay: Duration,
    pub http_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            keepalive_interval: KEEPALIVE_INTERVAL,
            keepalive_timeout: KEEPALIVE_TIMEOUT,
            settle_delay: SETTLE_DELAY,
            http_timeout: HTTP_TIMEOUT,
        }
    }
}

// ============================================================================
// TunnelConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Remote relay/server IP; the only source accepted on the server socket
    #[serde(alias = "serverIP")]
    pub server_address: IpAddr,
    /// Base URL of the negotiator
    #[serde(alias = "negotiator", alias = "negotiatorURL")]
    pub negotiator_url: String,
    /// Local UDP service port the tunnel listens on
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub service_port: u16,
    #[serde(default = "default_public_ip_url")]
    pub public_ip_url: String,
    #[serde(default)]
    pub port_byte_order: PortByteOrder,
    #[serde(skip)]
    pub timings: Timings,
}

fn default_public_ip_url() -> String {
    DEFAULT_PUBLIC_IP_URL.to_string()
}

/// Older clients stored the port as a text field
fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(p) => Ok(p),
        Port::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {:?}", s))),
    }
}

impl TunnelConfig {
    pub fn new(server_address: IpAddr, negotiator_url: impl Into<String>, service_port: u16) -> Self {
        Self {
            server_address,
            negotiator_url: negotiator_url.into(),
            service_port,
            public_ip_url: default_public_ip_url(),
            port_byte_order: PortByteOrder::default(),
            timings: Timings::default(),
        }
    }

    pub fn with_public_ip_url(mut self, url: impl Into<String>) -> Self {
        self.public_ip_url = url.into();
        self
    }

    pub fn with_port_byte_order(mut self, order: PortByteOrder) -> Self {
        self.port_byte_order = order;
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Parse a JSON config record
    pub fn from_json(json: &str) -> Result<Self, TunnelError> {
        serde_json::from_str(json).map_err(|e| TunnelError::InvalidConfig(e.to_string()))
    }

    /// Read a JSON config record from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TunnelError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            TunnelError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        let url = self.negotiator_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(TunnelError::InvalidConfig(format!(
                "negotiator URL must be http(s): {:?}",
                self.negotiator_url
            )));
        }
        if self.public_ip_url.trim().is_empty() {
            return Err(TunnelError::InvalidConfig("public IP URL is empty".into()));
        }
        if self.service_port == 0 {
            return Err(TunnelError::InvalidConfig("service port must be non-zero".into()));
        }
        Ok(())
    }
}
