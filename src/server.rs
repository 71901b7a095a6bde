//! HTTP front
//!
//! One router serves every HTTP listener. Requests go, in order, to the
//! tunnel proxy (CONNECT / CONNECT-UDP), the DoH endpoint (`/dns-query` or
//! `/dns/{token}`), the ticket API (`/ticket/`), and 404 otherwise.
//!
//! The HTTPS listener negotiates h2 and http/1.1 via ALPN and enables the
//! HTTP/2 extended CONNECT protocol for CONNECT-UDP. The plain HTTP listener
//! is meant for deployments behind a TLS-terminating ingress.
//!
//! There is no HTTP/3 listener here. The `h3` ALPN that discovery advertises
//! and any `Alt-Svc` header point at an external HTTP/3 front, which forwards
//! to these listeners with the client address in the failover header.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::header::{HeaderName, HeaderValue, ALT_SVC};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::dns::doh_server::{doh_token, response_error};
use crate::dns::{handle_doh, DohQuery, ResolverGateway};
use crate::tickets::{TicketApi, TICKET_PREFIX};
use crate::tunnel::TunnelProxy;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    #[error("Accept error: {0}")]
    Accept(#[from] std::io::Error),
}

/// Shared request router
#[derive(Clone)]
pub struct Gateway {
    resolver: ResolverGateway,
    tunnel: TunnelProxy,
    tickets: TicketApi,
    failover_header: Option<HeaderName>,
    alt_svc: Option<HeaderValue>,
}

impl Gateway {
    pub fn new(resolver: ResolverGateway, tunnel: TunnelProxy, tickets: TicketApi) -> Self {
        Self {
            resolver,
            tunnel,
            tickets,
            failover_header: None,
            alt_svc: None,
        }
    }

    /// Trust `header` for the client address of relayed queries
    pub fn with_failover_header(mut self, header: HeaderName) -> Self {
        self.failover_header = Some(header);
        self
    }

    /// Advertise `alt_svc` on every response
    pub fn with_alt_svc(mut self, alt_svc: HeaderValue) -> Self {
        self.alt_svc = Some(alt_svc);
        self
    }

    /// Route one request from `peer`
    pub async fn route(&self, req: Request<Body>, peer: SocketAddr) -> Response<Body> {
        let mut response = self.dispatch(req, peer).await;
        if let Some(alt_svc) = &self.alt_svc {
            response.headers_mut().insert(ALT_SVC, alt_svc.clone());
        }
        response
    }

    async fn dispatch(&self, req: Request<Body>, peer: SocketAddr) -> Response<Body> {
        if TunnelProxy::is_tunnel_request(&req) {
            return self.tunnel.handle(req).await;
        }

        if let Some((token, token_source)) = doh_token(&req) {
            let failover_addr = self
                .failover_header
                .as_ref()
                .and_then(|name| req.headers().get(name))
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let query = DohQuery {
                token,
                token_source,
                peer,
                failover_addr,
            };
            return handle_doh(req, &self.resolver, query).await;
        }

        if req.uri().path().starts_with(TICKET_PREFIX) {
            return self.tickets.handle(req).await;
        }

        response_error(StatusCode::NOT_FOUND, "Not Found")
    }

    /// Serve one accepted connection (h1 with upgrades, or h2)
    pub async fn serve_connection<S>(self: Arc<Self>, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let gateway = self;
        let service = service_fn(move |req| {
            let gateway = gateway.clone();
            async move { Ok::<_, Infallible>(gateway.route(req, peer).await) }
        });

        let conn = Http::new()
            .http2_enable_connect_protocol()
            .serve_connection(stream, service)
            .with_upgrades();

        if let Err(e) = conn.await {
            debug!("Connection from {} closed: {}", peer, e);
        }
    }
}

/// Serve HTTPS on `listener`
pub async fn serve_https(
    gateway: Arc<Gateway>,
    listener: TcpListener,
    tls_config: Arc<ServerConfig>,
) -> Result<(), ServerError> {
    let acceptor = TlsAcceptor::from(tls_config);
    info!("HTTPS listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept TCP connection: {}", e);
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let gateway = gateway.clone();
        tokio::spawn(async move {
            match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => gateway.serve_connection(tls_stream, peer).await,
                Ok(Err(e)) => debug!("TLS handshake failed for {}: {}", peer, e),
                Err(_) => debug!("TLS handshake timeout for {}", peer),
            }
        });
    }
}

/// Serve plain HTTP on `listener`
pub async fn serve_http(gateway: Arc<Gateway>, listener: TcpListener) -> Result<(), ServerError> {
    info!("HTTP listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept TCP connection: {}", e);
                continue;
            }
        };
        tokio::spawn(gateway.clone().serve_connection(stream, peer));
    }
}

/// Bind a TCP listener, mapping the error to the address
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind(addr, e))
}
