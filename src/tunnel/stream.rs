//! TCP stream tunnels (`CONNECT host:port`)

use std::time::Duration;

use hyper::{Body, Request, Response, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::relay::{relay, H2Stream, TunnelCloser};
use super::{status_response, Billing, TunnelError};

/// `host:port` target of a CONNECT request
pub fn connect_target<B>(req: &Request<B>) -> Result<String, TunnelError> {
    let authority = req
        .uri()
        .authority()
        .ok_or_else(|| TunnelError::BadTarget(req.uri().to_string()))?;
    if authority.port_u16().is_none() {
        return Err(TunnelError::BadTarget(format!("{} has no port", authority)));
    }
    Ok(authority.as_str().to_string())
}

/// Dial `target` within `dial_timeout`
pub async fn dial(target: &str, dial_timeout: Duration) -> Result<TcpStream, TunnelError> {
    match timeout(dial_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TunnelError::Dial(target.to_string(), e)),
        Err(_) => Err(TunnelError::DialTimeout(target.to_string())),
    }
}

/// Open a stream tunnel for an authorized CONNECT request
pub async fn open(req: Request<Body>, billing: Billing, dial_timeout: Duration) -> Response<Body> {
    let target = match connect_target(&req) {
        Ok(target) => target,
        Err(e) => {
            debug!("Rejecting CONNECT: {}", e);
            return status_response(StatusCode::BAD_REQUEST);
        }
    };

    let upstream = match dial(&target, dial_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("CONNECT {} for {} failed: {}", target, billing.token(), e);
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    debug!("CONNECT {} for {}", target, billing.token());

    if req.version() == Version::HTTP_2 {
        let (sender, body) = Body::channel();
        let client = H2Stream::new(req.into_body(), sender);
        tokio::spawn(run(client, upstream, billing));
        return Response::new(body);
    }

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => run(upgraded, upstream, billing).await,
            Err(e) => debug!("CONNECT upgrade to {} failed: {}", target, e),
        }
    });
    status_response(StatusCode::OK)
}

/// Relay `client` and `upstream` with the upstream leg metered
pub async fn run<C, U>(client: C, upstream: U, billing: Billing)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let closer = TunnelCloser::new();
    let meter = billing.meter();
    let upstream = meter.wrap(upstream);
    let handle = billing.start(meter, closer.clone());

    relay(client, upstream, &closer).await;
    handle.stop().await;
}
