//! Metered DNS Resolver Gateway
//!
//! Normalizes three DNS transports onto one forwarding pipeline:
//! - DoH GET: base64url `dns` query parameter (RFC 8484)
//! - DoH POST: raw `application/dns-message` body
//! - DoT: 2-byte length-prefixed messages over TLS (RFC 7858)
//!
//! Every query is authorized against the ledger, rewritten with an EDNS
//! Client-Subnet option, forwarded to an upstream DoH resolver and billed for
//! the bytes of both the query and the answer. `_dns.` SVCB discovery queries
//! and blocked domains are answered locally without billing.

pub mod blocklist;
pub mod discovery;
pub mod doh_server;
pub mod dot_server;
pub mod ecs;
pub mod resolver;
pub mod upstream;

pub use blocklist::{Blocklist, DomainBlocklist, NoBlocklist};
pub use doh_server::{handle_doh, DohQuery};
pub use dot_server::DotServer;
pub use resolver::ResolverGateway;
pub use upstream::{HttpsUpstream, Upstream, UpstreamError};

use std::net::SocketAddr;

use hyper::StatusCode;

/// Content-Type for DNS messages (RFC 8484)
pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Maximum DNS message size
pub const MAX_DNS_MESSAGE_SIZE: usize = 65535;

/// Where the access token of a query came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// `/dns/{token}` path segment
    Path,
    /// Leftmost label of the Host header or TLS server name
    Host,
}

/// One DNS query entering the gateway, transport already stripped
#[derive(Debug, Clone)]
pub struct DnsRequest {
    pub token: Option<String>,
    pub token_source: TokenSource,
    /// Raw DNS wire message
    pub message: Vec<u8>,
    /// Transport peer address
    pub peer: SocketAddr,
    /// Value of the trusted failover header, when the query was relayed
    pub failover_addr: Option<String>,
    /// Answer ad domains with NXDOMAIN
    pub block_ads: bool,
}

/// Resolver gateway errors
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResolveError {
    /// HTTP status used by the DoH front
    pub fn status(&self) -> StatusCode {
        match self {
            ResolveError::Unauthorized => StatusCode::UNAUTHORIZED,
            ResolveError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ResolveError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// First label of a host name, port stripped
pub fn leftmost_label(host: &str) -> Option<&str> {
    let host = host.split(':').next().unwrap_or(host);
    host.split('.').next().filter(|label| !label.is_empty())
}
