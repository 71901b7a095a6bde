//! DNS over TLS (DoT) Server
//!
//! Implements DNS over TLS (RFC 7858). The access token is the leftmost
//! label of the TLS server name the client asked for, so a client configured
//! with `<token>.dns.example` needs nothing else. Every message on the
//! connection goes through the same resolver pipeline as DoH; the first
//! rejected query closes the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::{leftmost_label, DnsRequest, ResolveError, ResolverGateway, TokenSource};

/// Maximum concurrent TLS connections
const MAX_CONCURRENT_CONNECTIONS: usize = 10000;

/// Connection timeout for TLS handshake
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle timeout between DNS messages
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum DotError {
    #[error("Failed to bind {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Response of {0} bytes does not fit a DNS frame")]
    MessageTooLarge(usize),

    #[error("Query rejected: {0}")]
    Rejected(#[from] ResolveError),
}

/// DNS over TLS Server
pub struct DotServer {
    addr: SocketAddr,
    tls_config: Arc<ServerConfig>,
    gateway: ResolverGateway,
    connection_semaphore: Arc<Semaphore>,
}

impl DotServer {
    pub fn new(addr: SocketAddr, tls_config: Arc<ServerConfig>, gateway: ResolverGateway) -> Self {
        Self {
            addr,
            tls_config,
            gateway,
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS)),
        }
    }

    /// Get the listen address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the DoT server
    pub async fn run(&self) -> Result<(), DotError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| DotError::Bind(self.addr, e))?;

        let acceptor = TlsAcceptor::from(self.tls_config.clone());

        info!("DoT server listening on {}", self.addr);

        loop {
            let (stream, client_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept TCP connection: {}", e);
                    continue;
                }
            };

            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Max connections reached, rejecting connection from {}", client_addr);
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let gateway = self.gateway.clone();

            tokio::spawn(async move {
                let _permit = permit;

                let tls_stream = match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        debug!("TLS handshake failed for {}: {}", client_addr, e);
                        return;
                    }
                    Err(_) => {
                        debug!("TLS handshake timeout for {}", client_addr);
                        return;
                    }
                };

                let token = tls_stream
                    .get_ref()
                    .1
                    .server_name()
                    .and_then(leftmost_label)
                    .map(str::to_string);

                debug!("DoT connection established from {}", client_addr);

                if let Err(e) = handle_connection(tls_stream, token, client_addr, &gateway).await {
                    debug!("DoT connection from {} closed: {}", client_addr, e);
                }
            });
        }
    }
}

/// Serve length-prefixed DNS messages until EOF or the first failure
pub async fn handle_connection<S>(
    mut stream: S,
    token: Option<String>,
    peer: SocketAddr,
    gateway: &ResolverGateway,
) -> Result<(), DotError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut queries_handled = 0u64;

    loop {
        let mut len_buf = [0u8; 2];
        match timeout(READ_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Client {} closed connection after {} queries", peer, queries_handled);
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!("Read timeout for client {}", peer);
                return Ok(());
            }
        }

        let msg_len = u16::from_be_bytes(len_buf) as usize;
        let mut message = vec![0u8; msg_len];
        stream.read_exact(&mut message).await?;

        let request = DnsRequest {
            token: token.clone(),
            token_source: TokenSource::Host,
            message,
            peer,
            failover_addr: None,
            block_ads: false,
        };
        let answer = gateway.resolve(request).await?;

        let answer_len =
            u16::try_from(answer.len()).map_err(|_| DotError::MessageTooLarge(answer.len()))?;
        stream.write_all(&answer_len.to_be_bytes()).await?;
        stream.write_all(&answer).await?;
        stream.flush().await?;

        queries_handled += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::upstream::{Upstream, UpstreamError};
    use crate::ledger::{FreeLedger, Ledger, SqliteLedger};
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    struct EchoUpstream;

    #[async_trait::async_trait]
    impl Upstream for EchoUpstream {
        async fn exchange(&self, query: Vec<u8>) -> Result<Vec<u8>, UpstreamError> {
            Ok(query)
        }
    }

    fn framed_query(id: u16) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(id);
        message.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        let bytes = message.to_vec().unwrap();
        let mut framed = (bytes.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&bytes);
        framed
    }

    async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Message {
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).await.unwrap();
        let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut buf).await.unwrap();
        Message::from_vec(&buf).unwrap()
    }

    fn peer() -> SocketAddr {
        "192.0.2.5:853".parse().unwrap()
    }

    #[tokio::test]
    async fn test_pipelined_queries() {
        let gateway = ResolverGateway::new(Arc::new(FreeLedger::new()), Arc::new(EchoUpstream));
        let (mut client, server) = tokio::io::duplex(4096);

        let task = tokio::spawn(async move {
            handle_connection(server, Some("tok".to_string()), peer(), &gateway).await
        });

        client.write_all(&framed_query(1)).await.unwrap();
        client.write_all(&framed_query(2)).await.unwrap();
        assert_eq!(read_frame(&mut client).await.id(), 1);
        assert_eq!(read_frame(&mut client).await.id(), 2);

        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unauthorized_closes_connection() {
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().unwrap());
        let gateway = ResolverGateway::new(ledger, Arc::new(EchoUpstream));
        let (mut client, server) = tokio::io::duplex(4096);

        let task = tokio::spawn(async move {
            handle_connection(server, Some("nobody".to_string()), peer(), &gateway).await
        });

        client.write_all(&framed_query(1)).await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(DotError::Rejected(ResolveError::Unauthorized))));

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let gateway = ResolverGateway::new(Arc::new(FreeLedger::new()), Arc::new(EchoUpstream));
        let (mut client, server) = tokio::io::duplex(4096);

        let task = tokio::spawn(async move {
            handle_connection(server, Some("tok".to_string()), peer(), &gateway).await
        });

        client.write_all(&[0, 40, 1, 2, 3]).await.unwrap();
        drop(client);
        assert!(matches!(task.await.unwrap(), Err(DotError::Io(_))));
    }
}
