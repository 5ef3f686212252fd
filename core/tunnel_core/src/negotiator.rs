//! Negotiator rendezvous client
//!
//! The negotiator is a third-party HTTP service that brokers the NAT mapping
//! between this client and the remote relay:
//!
//! ```text
//! HEAD {negotiator}                                  → 200 = reachable
//! GET  {negotiator}/{server}/{public_ip}:{client_port} → 200, body = server port
//! POST {negotiator}/{server}/{public_ip}:{client_port} → 200 = peer asked for its dummy
//! ```
//!
//! Each call blocks and is never retried here; a failed step ends the session.

use std::net::IpAddr;

use reqwest::blocking::Client;
use reqwest::StatusCode;

use crate::config::TunnelConfig;
use crate::error::TunnelError;

/// Rendezvous operations, executed strictly in order by the relay
pub trait Negotiator: Send {
    /// Check that the negotiator answers
    fn probe(&self) -> Result<(), TunnelError>;

    /// Public IP address of this host as seen from the internet
    fn resolve_public_address(&self) -> Result<IpAddr, TunnelError>;

    /// Ask the relay which port it will use for this client
    fn negotiate_port(
        &self,
        server: IpAddr,
        public: IpAddr,
        client_port: u16,
    ) -> Result<u16, TunnelError>;

    /// Ask the relay to make the remote peer emit its first packet
    fn request_peer_dummy(
        &self,
        server: IpAddr,
        public: IpAddr,
        client_port: u16,
    ) -> Result<(), TunnelError>;
}

/// Path shared by the GET and POST rendezvous requests
pub fn rendezvous_url(base: &str, server: IpAddr, public: IpAddr, client_port: u16) -> String {
    format!(
        "{}/{}/{}:{}",
        base.trim_end_matches('/'),
        server,
        public,
        client_port
    )
}

/// Parse the decimal server port returned by the negotiator
pub fn parse_server_port(body: &str) -> Result<u16, TunnelError> {
    let body = body.trim();
    match body.parse::<u16>() {
        Ok(0) | Err(_) => Err(TunnelError::NegotiationFailed(format!(
            "invalid server port in response: {:?}",
            body
        ))),
        Ok(port) => Ok(port),
    }
}

/// HTTP(S) negotiator client
#[derive(Debug, Clone)]
pub struct HttpNegotiator {
    client: Client,
    negotiator_url: String,
    public_ip_url: String,
}

impl HttpNegotiator {
    pub fn new(config: &TunnelConfig) -> Result<Self, TunnelError> {
        let client = Client::builder()
            .timeout(config.timings.http_timeout)
            .build()
            .map_err(|e| TunnelError::InvalidConfig(format!("HTTP client: {}", e)))?;
        Ok(Self::with_client(config, client))
    }

    /// Use a caller-built client (custom proxy or TLS settings)
    pub fn with_client(config: &TunnelConfig, client: Client) -> Self {
        Self {
            client,
            negotiator_url: config.negotiator_url.trim().trim_end_matches('/').to_string(),
            public_ip_url: config.public_ip_url.trim().to_string(),
        }
    }
}

impl Negotiator for HttpNegotiator {
    fn probe(&self) -> Result<(), TunnelError> {
        let res = self
            .client
            .head(&self.negotiator_url)
            .send()
            .map_err(|e| TunnelError::NegotiatorUnreachable(e.to_string()))?;

        if res.status() != StatusCode::OK {
            return Err(TunnelError::NegotiatorUnreachable(format!(
                "status {}",
                res.status()
            )));
        }
        Ok(())
    }

    fn resolve_public_address(&self) -> Result<IpAddr, TunnelError> {
        let res = self
            .client
            .get(&self.public_ip_url)
            .send()
            .map_err(|e| TunnelError::PublicIpUnavailable(e.to_string()))?;

        if res.status() != StatusCode::OK {
            return Err(TunnelError::PublicIpUnavailable(format!(
                "status {}",
                res.status()
            )));
        }

        let body = res
            .text()
            .map_err(|e| TunnelError::PublicIpUnavailable(e.to_string()))?;
        body.trim().parse().map_err(|_| {
            TunnelError::PublicIpUnavailable(format!("not an IP address: {:?}", body.trim()))
        })
    }

    fn negotiate_port(
        &self,
        server: IpAddr,
        public: IpAddr,
        client_port: u16,
    ) -> Result<u16, TunnelError> {
        let url = rendezvous_url(&self.negotiator_url, server, public, client_port);
        log::debug!("GET {}", url);

        let res = self
            .client
            .get(&url)
            .send()
            .map_err(|e| TunnelError::NegotiationFailed(e.to_string()))?;

        if res.status() != StatusCode::OK {
            return Err(TunnelError::NegotiationFailed(format!(
                "status {}",
                res.status()
            )));
        }

        let body = res
            .text()
            .map_err(|e| TunnelError::NegotiationFailed(e.to_string()))?;
        parse_server_port(&body)
    }

    fn request_peer_dummy(
        &self,
        server: IpAddr,
        public: IpAddr,
        client_port: u16,
    ) -> Result<(), TunnelError> {
        let url = rendezvous_url(&self.negotiator_url, server, public, client_port);
        log::debug!("POST {}", url);

        let res = self
            .client
            .post(&url)
            .send()
            .map_err(|e| TunnelError::DummyRequestFailed(e.to_string()))?;

        if res.status() != StatusCode::OK {
            return Err(TunnelError::DummyRequestFailed(format!(
                "status {}",
                res.status()
            )));
        }
        Ok(())
    }
}
