//! Metered Tunnel Proxy
//!
//! CONNECT-style tunnels for clients holding a ledger token:
//! - Stream tunnels: `CONNECT host:port` over HTTP/1.1 (connection upgrade)
//!   or HTTP/2 (request/response body pair)
//! - Datagram tunnels: CONNECT-UDP (RFC 9298) with DATAGRAM capsules
//!   (RFC 9297) carried on the HTTP stream
//!
//! Only the upstream leg is metered. Its byte count is debited periodically
//! with a multiplier; a failed debit closes the tunnel.

pub mod auth;
pub mod datagram;
pub mod relay;
pub mod stream;
pub mod varint;

pub use relay::{relay, H2Stream, TunnelCloser};

use std::sync::Arc;
use std::time::Duration;

use hyper::header::UPGRADE;
use hyper::{Body, Method, Request, Response, StatusCode};
use tracing::{debug, warn};

use crate::config::TunnelConfig;
use crate::ledger::Ledger;
use crate::meter::{Meter, MeterHandle};

/// Protocol token for CONNECT-UDP (RFC 9298)
pub const CONNECT_UDP: &str = "connect-udp";

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Invalid tunnel target: {0}")]
    BadTarget(String),

    #[error("Dial timeout for {0}")]
    DialTimeout(String),

    #[error("Failed to reach {0}: {1}")]
    Dial(String, std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel request handler
#[derive(Clone)]
pub struct TunnelProxy {
    ledger: Arc<dyn Ledger>,
    config: TunnelConfig,
}

impl TunnelProxy {
    pub fn new(ledger: Arc<dyn Ledger>, config: TunnelConfig) -> Self {
        Self { ledger, config }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Whether `req` asks for a tunnel at all
    pub fn is_tunnel_request<B>(req: &Request<B>) -> bool {
        req.method() == Method::CONNECT || is_connect_udp(req)
    }

    /// Authorize and open a tunnel
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let token = match auth::proxy_token(req.headers()) {
            Some(token) => token,
            None => return auth::proxy_auth_required(),
        };

        match self.ledger.is_active(&token).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Tunnel refused for inactive token {}", token);
                return auth::proxy_auth_required();
            }
            Err(e) => {
                warn!("Ledger lookup for {} failed: {}", token, e);
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }

        let billing = Billing {
            ledger: self.ledger.clone(),
            token,
            multiplier: self.config.cost_multiplier,
            interval: self.config.meter_interval(),
        };

        if is_connect_udp(&req) {
            datagram::open(req, billing, self.config.dial_timeout()).await
        } else {
            stream::open(req, billing, self.config.dial_timeout()).await
        }
    }
}

/// CONNECT-UDP over HTTP/1.1 upgrade or HTTP/2 extended CONNECT
pub fn is_connect_udp<B>(req: &Request<B>) -> bool {
    let h1_upgrade = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.eq_ignore_ascii_case(CONNECT_UDP));
    let h2_protocol = req.method() == Method::CONNECT
        && req
            .extensions()
            .get::<hyper::ext::Protocol>()
            .map_or(false, |p| p.as_str().eq_ignore_ascii_case(CONNECT_UDP));
    h1_upgrade || h2_protocol
}

/// Per-tunnel debit settings
#[derive(Clone)]
pub struct Billing {
    ledger: Arc<dyn Ledger>,
    token: String,
    multiplier: i64,
    interval: Duration,
}

impl Billing {
    pub fn new(ledger: Arc<dyn Ledger>, token: impl Into<String>, multiplier: i64, interval: Duration) -> Self {
        Self {
            ledger,
            token: token.into(),
            multiplier,
            interval,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Meter for the upstream leg of one tunnel
    pub fn meter(&self) -> Meter {
        Meter::new(self.interval)
    }

    /// Start debiting `meter`; a failed debit closes the tunnel
    pub fn start(&self, meter: Meter, closer: TunnelCloser) -> MeterHandle {
        let ledger = self.ledger.clone();
        let token = self.token.clone();
        let multiplier = self.multiplier;

        meter.start(move |n| {
            let ledger = ledger.clone();
            let token = token.clone();
            let closer = closer.clone();
            async move {
                let cost = (n as i64).saturating_mul(multiplier);
                let result = ledger.cost(&token, cost).await;
                if result.is_err() {
                    warn!("Closing tunnel for {}: debit of {} bytes failed", token, cost);
                    closer.close();
                }
                result
            }
        })
    }
}

pub(crate) fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}
