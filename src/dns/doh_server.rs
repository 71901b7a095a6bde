//! DNS over HTTPS (DoH) front
//!
//! Implements RFC 8484 GET (`?dns=` base64url) and POST (raw body) on two
//! path shapes:
//! - `/dns-query`: token is the leftmost label of the Host
//! - `/dns/{token}`: token is the path segment
//!
//! A `noad` query parameter asks for ad domains to be answered NXDOMAIN.

use std::collections::HashMap;
use std::net::SocketAddr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hickory_proto::op::Message;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, HOST};
use hyper::{Body, Method, Request, Response, StatusCode};
use tracing::debug;

use super::{
    leftmost_label, DnsRequest, ResolveError, ResolverGateway, TokenSource,
    DNS_MESSAGE_CONTENT_TYPE, MAX_DNS_MESSAGE_SIZE,
};

/// Host-token DoH path
pub const DOH_PATH: &str = "/dns-query";

/// Prefix of token-in-path DoH paths
pub const DOH_TOKEN_PREFIX: &str = "/dns/";

/// Transport details of one DoH request
#[derive(Debug, Clone)]
pub struct DohQuery {
    pub token: Option<String>,
    pub token_source: TokenSource,
    pub peer: SocketAddr,
    pub failover_addr: Option<String>,
}

/// Token carried by a DoH request, or `None` when the path is not a DoH path
pub fn doh_token<B>(req: &Request<B>) -> Option<(Option<String>, TokenSource)> {
    let path = req.uri().path();

    if path == DOH_PATH {
        let host = req
            .uri()
            .host()
            .or_else(|| req.headers().get(HOST).and_then(|v| v.to_str().ok()));
        let token = host.and_then(leftmost_label).map(str::to_string);
        return Some((token, TokenSource::Host));
    }

    let rest = path.strip_prefix(DOH_TOKEN_PREFIX)?;
    let token = rest.trim_end_matches('/');
    if token.is_empty() || token.contains('/') {
        return None;
    }
    let token = urlencoding::decode(token)
        .map(|t| t.into_owned())
        .unwrap_or_else(|_| token.to_string());
    Some((Some(token), TokenSource::Path))
}

/// Serve one DoH request
pub async fn handle_doh(
    req: Request<Body>,
    gateway: &ResolverGateway,
    query: DohQuery,
) -> Response<Body> {
    let method = req.method().clone();
    debug!("DoH request: {} {} from {}", method, req.uri().path(), query.peer);

    let params: HashMap<String, String> = req
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let block_ads = params.contains_key("noad");

    let message = match method {
        Method::GET => decode_get(&params),
        Method::POST => read_post(req).await,
        _ => return response_error(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
    };
    let message = match message {
        Ok(message) => message,
        Err(e) => return resolve_error_response(&e),
    };

    let request = DnsRequest {
        token: query.token,
        token_source: query.token_source,
        message,
        peer: query.peer,
        failover_addr: query.failover_addr,
        block_ads,
    };

    match gateway.resolve(request).await {
        Ok(answer) => {
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE);
            if let Some(ttl) = extract_min_ttl(&answer) {
                builder = builder.header(CACHE_CONTROL, format!("max-age={}", ttl));
            }
            builder
                .body(Body::from(answer))
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
        Err(e) => resolve_error_response(&e),
    }
}

fn decode_get(params: &HashMap<String, String>) -> Result<Vec<u8>, ResolveError> {
    let dns_param = params
        .get("dns")
        .ok_or_else(|| ResolveError::BadRequest("Missing 'dns' query parameter".to_string()))?;

    let message = URL_SAFE_NO_PAD
        .decode(dns_param.trim_end_matches('='))
        .map_err(|e| ResolveError::BadRequest(format!("Invalid base64url encoding: {}", e)))?;

    if message.len() > MAX_DNS_MESSAGE_SIZE {
        return Err(ResolveError::BadRequest("DNS message too large".to_string()));
    }
    Ok(message)
}

async fn read_post(req: Request<Body>) -> Result<Vec<u8>, ResolveError> {
    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| ResolveError::BadRequest(format!("Failed to read body: {}", e)))?;

    if body.len() > MAX_DNS_MESSAGE_SIZE {
        return Err(ResolveError::BadRequest("DNS message too large".to_string()));
    }
    Ok(body.to_vec())
}

/// Smallest answer TTL, used for Cache-Control
pub fn extract_min_ttl(answer: &[u8]) -> Option<u32> {
    let message = Message::from_vec(answer).ok()?;
    message.answers().iter().map(|record| record.ttl()).min()
}

fn resolve_error_response(e: &ResolveError) -> Response<Body> {
    debug!("DoH request rejected: {}", e);
    let message = match e {
        ResolveError::Unauthorized => "Unauthorized".to_string(),
        ResolveError::BadRequest(msg) => msg.clone(),
        ResolveError::Internal(_) => "Internal Server Error".to_string(),
    };
    response_error(e.status(), &message)
}

/// Plain-text error response
pub fn response_error(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::upstream::{Upstream, UpstreamError};
    use crate::ledger::{FreeLedger, Ledger, SqliteLedger};
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;
    use std::sync::Arc;

    /// Answers every query with one A record
    struct StaticUpstream;

    #[async_trait::async_trait]
    impl Upstream for StaticUpstream {
        async fn exchange(&self, query: Vec<u8>) -> Result<Vec<u8>, UpstreamError> {
            let mut message = Message::from_vec(&query).unwrap();
            let name = message.queries()[0].name().clone();
            message.set_message_type(hickory_proto::op::MessageType::Response);
            message.add_answer(Record::from_rdata(name.clone(), 300, RData::A(A::new(1, 2, 3, 4))));
            message.add_answer(Record::from_rdata(name, 60, RData::A(A::new(5, 6, 7, 8))));
            Ok(message.to_vec().unwrap())
        }
    }

    fn query_bytes() -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(7);
        message.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        message.to_vec().unwrap()
    }

    fn doh_query(token: &str) -> DohQuery {
        DohQuery {
            token: Some(token.to_string()),
            token_source: TokenSource::Path,
            peer: "192.0.2.1:1000".parse().unwrap(),
            failover_addr: None,
        }
    }

    fn free_gateway() -> ResolverGateway {
        ResolverGateway::new(Arc::new(FreeLedger::new()), Arc::new(StaticUpstream))
    }

    #[test]
    fn test_doh_token_from_path() {
        let req = Request::builder().uri("/dns/abc").body(()).unwrap();
        assert_eq!(doh_token(&req), Some((Some("abc".to_string()), TokenSource::Path)));

        let req = Request::builder().uri("/dns/abc/?dns=AAAA").body(()).unwrap();
        assert_eq!(doh_token(&req), Some((Some("abc".to_string()), TokenSource::Path)));

        let req = Request::builder().uri("/dns/").body(()).unwrap();
        assert_eq!(doh_token(&req), None);

        let req = Request::builder().uri("/other").body(()).unwrap();
        assert_eq!(doh_token(&req), None);
    }

    #[test]
    fn test_doh_token_from_host() {
        let req = Request::builder()
            .uri("/dns-query")
            .header(HOST, "tok.dns.example:443")
            .body(())
            .unwrap();
        assert_eq!(doh_token(&req), Some((Some("tok".to_string()), TokenSource::Host)));

        let req = Request::builder()
            .uri("https://abc.dns.example/dns-query")
            .body(())
            .unwrap();
        assert_eq!(doh_token(&req), Some((Some("abc".to_string()), TokenSource::Host)));
    }

    #[tokio::test]
    async fn test_get_request() {
        let encoded = URL_SAFE_NO_PAD.encode(query_bytes());
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("/dns/tok?dns={}", encoded))
            .body(Body::empty())
            .unwrap();

        let response = handle_doh(req, &free_gateway(), doh_query("tok")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            DNS_MESSAGE_CONTENT_TYPE
        );
        assert_eq!(response.headers().get(CACHE_CONTROL).unwrap(), "max-age=60");

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let answer = Message::from_vec(&body).unwrap();
        assert_eq!(answer.id(), 7);
        assert_eq!(answer.answers().len(), 2);
    }

    #[tokio::test]
    async fn test_post_request() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/dns/tok")
            .header(CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
            .body(Body::from(query_bytes()))
            .unwrap();

        let response = handle_doh(req, &free_gateway(), doh_query("tok")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_get_missing_or_invalid_param() {
        let req = Request::builder()
            .uri("/dns/tok")
            .body(Body::empty())
            .unwrap();
        let response = handle_doh(req, &free_gateway(), doh_query("tok")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let req = Request::builder()
            .uri("/dns/tok?dns=!!!")
            .body(Body::empty())
            .unwrap();
        let response = handle_doh(req, &free_gateway(), doh_query("tok")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_token_is_401() {
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().unwrap());
        let gateway = ResolverGateway::new(ledger, Arc::new(StaticUpstream));

        let req = Request::builder()
            .method(Method::POST)
            .uri("/dns/nobody")
            .body(Body::from(query_bytes()))
            .unwrap();
        let response = handle_doh(req, &gateway, doh_query("nobody")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let req = Request::builder()
            .method(Method::PUT)
            .uri("/dns/tok")
            .body(Body::empty())
            .unwrap();
        let response = handle_doh(req, &free_gateway(), doh_query("tok")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_extract_min_ttl_without_answers() {
        assert_eq!(extract_min_ttl(&query_bytes()), None);
        assert_eq!(extract_min_ttl(&[0, 1]), None);
    }
}
