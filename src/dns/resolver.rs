//! Resolver gateway pipeline
//!
//! Order of operations for one query:
//! 1. authorize the token against the ledger
//! 2. parse, reject empty questions
//! 3. answer `_dns.` SVCB discovery locally
//! 4. answer blocked domains with NXDOMAIN when ad-blocking was requested
//! 5. rewrite EDNS Client-Subnet for the effective client address
//! 6. forward to the upstream resolver
//! 7. bill query plus answer bytes; a failed debit discards the answer
//!
//! Discovery and blocked answers are never billed.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use tracing::{debug, warn};

use super::blocklist::{Blocklist, NoBlocklist};
use super::upstream::Upstream;
use super::{discovery, ecs, DnsRequest, ResolveError};
use crate::ledger::Ledger;

/// Cost multiplier for queries relayed by a failover ingress
pub const DEFAULT_FAILOVER_MULTIPLIER: i64 = 100;

/// Metered forwarding resolver shared by the DoH and DoT fronts
#[derive(Clone)]
pub struct ResolverGateway {
    ledger: Arc<dyn Ledger>,
    upstream: Arc<dyn Upstream>,
    blocklist: Arc<dyn Blocklist>,
    failover_multiplier: i64,
}

impl ResolverGateway {
    pub fn new(ledger: Arc<dyn Ledger>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            ledger,
            upstream,
            blocklist: Arc::new(NoBlocklist),
            failover_multiplier: DEFAULT_FAILOVER_MULTIPLIER,
        }
    }

    pub fn with_blocklist(mut self, blocklist: Arc<dyn Blocklist>) -> Self {
        self.blocklist = blocklist;
        self
    }

    pub fn with_failover_multiplier(mut self, multiplier: i64) -> Self {
        self.failover_multiplier = multiplier;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Resolve one query, returning the wire answer
    pub async fn resolve(&self, request: DnsRequest) -> Result<Vec<u8>, ResolveError> {
        let token = match request.token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ => return Err(ResolveError::Unauthorized),
        };

        match self.ledger.is_active(token).await {
            Ok(true) => {}
            Ok(false) => return Err(ResolveError::Unauthorized),
            Err(e) => {
                warn!("Ledger lookup for {} failed: {}", token, e);
                return Err(ResolveError::Internal(format!("Ledger lookup: {}", e)));
            }
        }

        let mut message = Message::from_vec(&request.message)
            .map_err(|e| ResolveError::BadRequest(format!("Invalid DNS message: {}", e)))?;
        let query = message
            .queries()
            .first()
            .cloned()
            .ok_or_else(|| ResolveError::BadRequest("Empty question section".to_string()))?;

        debug!("Query {} {} for token {}", query.name(), query.query_type(), token);

        if discovery::is_discovery_query(&query) {
            let response =
                discovery::discovery_response(&message, &query, token, request.token_source)
                    .map_err(|e| ResolveError::Internal(format!("Discovery answer: {}", e)))?;
            return encode(&response);
        }

        if request.block_ads && self.blocklist.is_blocked(&query.name().to_string()) {
            debug!("Blocked {} for token {}", query.name(), token);
            return encode(&nxdomain_response(&message, &query));
        }

        let (client_ip, multiplier) = match request.failover_addr.as_deref() {
            Some(value) => (
                parse_failover_addr(value).unwrap_or_else(|| request.peer.ip()),
                self.failover_multiplier,
            ),
            None => (request.peer.ip(), 1),
        };

        ecs::apply(&mut message, client_ip);
        let forwarded = encode(&message)?;
        let forwarded_len = forwarded.len();

        let answer = self
            .upstream
            .exchange(forwarded)
            .await
            .map_err(|e| ResolveError::Internal(e.to_string()))?;

        let cost = (forwarded_len + answer.len()) as i64 * multiplier;
        if let Err(e) = self.ledger.cost(token, cost).await {
            warn!("Debit of {} bytes for {} failed: {}", cost, token, e);
            return Err(ResolveError::Unauthorized);
        }

        Ok(answer)
    }
}

/// Failover header value: `ip:port` or a bare address
pub fn parse_failover_addr(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    value
        .parse::<SocketAddr>()
        .map(|addr| addr.ip())
        .or_else(|_| value.parse::<IpAddr>())
        .ok()
}

fn nxdomain_response(request: &Message, query: &Query) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_authoritative(true);
    response.set_response_code(ResponseCode::NXDomain);
    response.add_query(query.clone());
    response
}

fn encode(message: &Message) -> Result<Vec<u8>, ResolveError> {
    message
        .to_vec()
        .map_err(|e| ResolveError::Internal(format!("Failed to encode DNS message: {}", e)))
}
