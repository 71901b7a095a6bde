//! UDP datagram tunnels (CONNECT-UDP, RFC 9298)
//!
//! The target comes from the well-known URI template
//! `/.well-known/masque/udp/{host}/{port}/`. UDP payloads travel on the HTTP
//! stream as DATAGRAM capsules (RFC 9297):
//!
//! ```text
//! capsule  = type (varint, 0x00) | length (varint) | value
//! value    = context id (varint) | UDP payload
//! ```
//!
//! The context id is stripped and the rest of the value is forwarded as one
//! UDP datagram whatever its context. Capsule types other than DATAGRAM are
//! skipped. Datagrams sent back to the client always use context id 0.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use hyper::header::{HeaderValue, CONNECTION, UPGRADE};
use hyper::{Body, Request, Response, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use super::relay::{H2Stream, TunnelCloser};
use super::{status_response, varint, Billing, TunnelError, CONNECT_UDP};
use crate::meter::ByteCounter;

/// Path prefix of the CONNECT-UDP URI template
pub const MASQUE_UDP_PREFIX: &str = "/.well-known/masque/udp/";

/// Capsule type carrying HTTP datagrams
pub const DATAGRAM_CAPSULE: u64 = 0x00;

/// Context id of plain UDP payloads
pub const UDP_PAYLOAD_CONTEXT: u64 = 0;

/// Largest UDP payload relayed in either direction
pub const MAX_UDP_PAYLOAD: usize = 65527;

const CAPSULE_PROTOCOL: &str = "capsule-protocol";

/// `(host, port)` encoded in a CONNECT-UDP path
pub fn parse_target(path: &str) -> Result<(String, u16), TunnelError> {
    let bad = || TunnelError::BadTarget(path.to_string());

    let rest = path.strip_prefix(MASQUE_UDP_PREFIX).ok_or_else(bad)?;
    let mut parts = rest.trim_end_matches('/').split('/');
    let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(bad)?;
    let port = parts.next().ok_or_else(bad)?;
    if parts.next().is_some() {
        return Err(bad());
    }

    let host = urlencoding::decode(host).map_err(|_| bad())?.into_owned();
    let port = port.parse::<u16>().map_err(|_| bad())?;
    if port == 0 {
        return Err(bad());
    }
    Ok((host, port))
}

/// Append a DATAGRAM capsule carrying `payload` to `buf`
pub fn encode_datagram(payload: &[u8], buf: &mut Vec<u8>) -> io::Result<()> {
    let context_len = varint::encoded_len(UDP_PAYLOAD_CONTEXT);
    varint::encode(DATAGRAM_CAPSULE, buf)?;
    varint::encode((context_len + payload.len()) as u64, buf)?;
    varint::encode(UDP_PAYLOAD_CONTEXT, buf)?;
    buf.extend_from_slice(payload);
    Ok(())
}

/// One capsule read off the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capsule {
    pub capsule_type: u64,
    pub value: Vec<u8>,
}

impl Capsule {
    /// UDP payload of a DATAGRAM capsule, context id stripped
    pub fn udp_payload(&self) -> Option<&[u8]> {
        if self.capsule_type != DATAGRAM_CAPSULE {
            return None;
        }
        let (_context, len) = varint::decode(&self.value)?;
        Some(&self.value[len..])
    }
}

/// Read the next capsule. `Ok(None)` on a clean end of stream.
pub async fn read_capsule<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Capsule>> {
    let capsule_type = match varint::read(reader).await? {
        Some(t) => t,
        None => return Ok(None),
    };
    let len = varint::read(reader)
        .await?
        .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
    if len > (MAX_UDP_PAYLOAD + 8) as u64 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "capsule too large"));
    }

    let mut value = vec![0u8; len as usize];
    reader.read_exact(&mut value).await?;
    Ok(Some(Capsule {
        capsule_type,
        value,
    }))
}

/// Resolve `host:port` and connect a UDP socket to it
pub async fn dial(host: &str, port: u16, dial_timeout: Duration) -> Result<UdpSocket, TunnelError> {
    let target = format!("{}:{}", host, port);
    let connect = async {
        let addr = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address"))?;
        let local = if addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok::<_, io::Error>(socket)
    };

    match timeout(dial_timeout, connect).await {
        Ok(Ok(socket)) => Ok(socket),
        Ok(Err(e)) => Err(TunnelError::Dial(target, e)),
        Err(_) => Err(TunnelError::DialTimeout(target)),
    }
}

/// Open a datagram tunnel for an authorized CONNECT-UDP request
pub async fn open(req: Request<Body>, billing: Billing, dial_timeout: Duration) -> Response<Body> {
    let (host, port) = match parse_target(req.uri().path()) {
        Ok(target) => target,
        Err(e) => {
            debug!("Rejecting CONNECT-UDP: {}", e);
            return status_response(StatusCode::BAD_REQUEST);
        }
    };

    let socket = match dial(&host, port, dial_timeout).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("CONNECT-UDP for {} failed: {}", billing.token(), e);
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    debug!("CONNECT-UDP {}:{} for {}", host, port, billing.token());

    if req.version() == Version::HTTP_2 {
        let (sender, body) = Body::channel();
        let client = H2Stream::new(req.into_body(), sender);
        tokio::spawn(run(client, socket, billing));

        let mut response = Response::new(body);
        response
            .headers_mut()
            .insert(CAPSULE_PROTOCOL, HeaderValue::from_static("?1"));
        return response;
    }

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => run(upgraded, socket, billing).await,
            Err(e) => debug!("CONNECT-UDP upgrade failed: {}", e),
        }
    });

    let mut response = status_response(StatusCode::SWITCHING_PROTOCOLS);
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static(CONNECT_UDP));
    headers.insert(CAPSULE_PROTOCOL, HeaderValue::from_static("?1"));
    response
}

/// Relay capsules on `client` and datagrams on `socket`, metering the socket
pub async fn run<C>(client: C, socket: UdpSocket, billing: Billing)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let closer = TunnelCloser::new();
    let meter = billing.meter();
    let counter = meter.counter();
    let handle = billing.start(meter, closer.clone());

    relay_datagrams(client, &socket, &counter, &closer).await;
    handle.stop().await;
}

/// Shuttle datagrams until either side ends or `closer` fires
pub async fn relay_datagrams<C>(client: C, socket: &UdpSocket, counter: &ByteCounter, closer: &TunnelCloser)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);

    tokio::select! {
        result = capsules_to_socket(&mut client_read, socket, counter) => if let Err(e) = result {
            debug!("Capsule->UDP relay error: {}", e);
        },
        result = socket_to_capsules(socket, &mut client_write, counter) => if let Err(e) = result {
            debug!("UDP->Capsule relay error: {}", e);
        },
        _ = closer.closed() => debug!("Datagram tunnel closed"),
    }

    closer.close();
}

async fn capsules_to_socket<R: AsyncRead + Unpin>(
    reader: &mut R,
    socket: &UdpSocket,
    counter: &ByteCounter,
) -> io::Result<()> {
    while let Some(capsule) = read_capsule(reader).await? {
        match capsule.udp_payload() {
            Some(payload) => {
                let n = socket.send(payload).await?;
                counter.add(n as u64);
            }
            None => debug!("Skipping capsule type {}", capsule.capsule_type),
        }
    }
    Ok(())
}

async fn socket_to_capsules<W: AsyncWrite + Unpin>(
    socket: &UdpSocket,
    writer: &mut W,
    counter: &ByteCounter,
) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    let mut frame = Vec::with_capacity(MAX_UDP_PAYLOAD + 16);
    loop {
        let n = socket.recv(&mut buf).await?;
        counter.add(n as u64);

        frame.clear();
        encode_datagram(&buf[..n], &mut frame)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
}
