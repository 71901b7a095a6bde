use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use hickory_proto::op::{Edns, Message, Query};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::{Name, RData, RecordType};

use zns_gateway::dns::{
    DnsRequest, ResolveError, ResolverGateway, TokenSource, Upstream, UpstreamError,
};
use zns_gateway::ledger::{Ledger, SqliteLedger};

/// Records forwarded queries and answers with `total - len(query)` bytes,
/// so every exchange bills exactly `total`
struct ScriptedUpstream {
    total: Mutex<usize>,
    seen: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedUpstream {
    fn new(total: usize) -> Arc<Self> {
        Arc::new(Self {
            total: Mutex::new(total),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn set_total(&self, total: usize) {
        *self.total.lock().unwrap() = total;
    }

    fn forwarded(&self) -> Vec<Message> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|q| Message::from_vec(q).unwrap())
            .collect()
    }
}

#[async_trait::async_trait]
impl Upstream for ScriptedUpstream {
    async fn exchange(&self, query: Vec<u8>) -> Result<Vec<u8>, UpstreamError> {
        let total = *self.total.lock().unwrap();
        let answer = vec![0u8; total.saturating_sub(query.len())];
        self.seen.lock().unwrap().push(query);
        Ok(answer)
    }
}

fn query(name: &str, rtype: RecordType) -> Message {
    let mut message = Message::new();
    message.set_id(4242);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
    message
}

fn request(token: &str, message: &Message, peer: &str) -> DnsRequest {
    DnsRequest {
        token: Some(token.to_string()),
        token_source: TokenSource::Path,
        message: message.to_vec().unwrap(),
        peer: peer.parse().unwrap(),
        failover_addr: None,
        block_ads: false,
    }
}

fn forwarded_subnet(message: &Message) -> ClientSubnet {
    let edns = message.extensions().as_ref().expect("OPT record");
    match edns.option(EdnsCode::Subnet) {
        Some(EdnsOption::Subnet(subnet)) => subnet.clone(),
        other => panic!("no client subnet: {:?}", other),
    }
}

async fn setup(bytes: i64, total: usize) -> (ResolverGateway, Arc<ScriptedUpstream>, Arc<SqliteLedger>) {
    let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
    ledger.create("foo", bytes, "order-1", "").await.unwrap();
    let upstream = ScriptedUpstream::new(total);
    let gateway = ResolverGateway::new(ledger.clone(), upstream.clone());
    (gateway, upstream, ledger)
}

#[tokio::test]
async fn test_ecs_synthesized_from_ipv4_peer() {
    let (gateway, upstream, _) = setup(10_000, 200).await;
    let message = query("example.com.", RecordType::A);

    gateway
        .resolve(request("foo", &message, "198.51.100.77:40000"))
        .await
        .unwrap();

    let subnet = forwarded_subnet(&upstream.forwarded()[0]);
    assert_eq!(subnet.addr(), IpAddr::from_str("198.51.100.0").unwrap());
    assert_eq!(subnet.source_prefix(), 24);
}

#[tokio::test]
async fn test_ecs_synthesized_from_ipv6_peer() {
    let (gateway, upstream, _) = setup(10_000, 200).await;
    let message = query("example.com.", RecordType::AAAA);

    gateway
        .resolve(request("foo", &message, "[2001:db8:1234:5678::1]:40000"))
        .await
        .unwrap();

    let subnet = forwarded_subnet(&upstream.forwarded()[0]);
    assert_eq!(subnet.addr(), IpAddr::from_str("2001:db8:1234::").unwrap());
    assert_eq!(subnet.source_prefix(), 48);
}

#[tokio::test]
async fn test_caller_subnet_passes_through() {
    let (gateway, upstream, _) = setup(10_000, 200).await;
    let mut message = query("example.com.", RecordType::A);
    let mut edns = Edns::new();
    edns.options_mut().insert(EdnsOption::Subnet(ClientSubnet::new(
        IpAddr::from_str("203.0.113.0").unwrap(),
        24,
        0,
    )));
    *message.extensions_mut() = Some(edns);

    gateway
        .resolve(request("foo", &message, "198.51.100.77:40000"))
        .await
        .unwrap();

    let subnet = forwarded_subnet(&upstream.forwarded()[0]);
    assert_eq!(subnet.addr(), IpAddr::from_str("203.0.113.0").unwrap());
}

#[tokio::test]
async fn test_discovery_is_local_and_free() {
    let (gateway, upstream, ledger) = setup(10_000, 200).await;
    let message = query("_dns.resolver.example.", RecordType::SVCB);

    let answer = gateway
        .resolve(request("foo", &message, "198.51.100.77:40000"))
        .await
        .unwrap();

    assert!(upstream.forwarded().is_empty());
    assert_eq!(ledger.list("foo", 1).await.unwrap()[0].bytes, 10_000);

    let answer = Message::from_vec(&answer).unwrap();
    assert_eq!(answer.id(), 4242);
    let priorities: Vec<u16> = answer
        .answers()
        .iter()
        .map(|r| match r.data() {
            RData::SVCB(svcb) => svcb.svc_priority(),
            other => panic!("unexpected record {:?}", other),
        })
        .collect();
    assert_eq!(priorities, vec![1, 2]);
}

#[tokio::test]
async fn test_failover_ingress_multiplies_cost() {
    let (gateway, upstream, ledger) = setup(100_000, 200).await;
    let message = query("example.com.", RecordType::A);
    let mut req = request("foo", &message, "10.0.0.1:443");
    req.failover_addr = Some("192.0.2.99:1234".to_string());

    gateway.resolve(req).await.unwrap();

    assert_eq!(ledger.list("foo", 1).await.unwrap()[0].bytes, 100_000 - 200 * 100);
    let subnet = forwarded_subnet(&upstream.forwarded()[0]);
    assert_eq!(subnet.addr(), IpAddr::from_str("192.0.2.0").unwrap());
}

#[tokio::test]
async fn test_overdraft_completes_then_gate_closes() {
    let (gateway, upstream, ledger) = setup(1_000, 400).await;
    let message = query("example.com.", RecordType::A);

    gateway
        .resolve(request("foo", &message, "198.51.100.77:40000"))
        .await
        .unwrap();
    assert_eq!(ledger.list("foo", 1).await.unwrap()[0].bytes, 600);

    // Exceeds the balance, still answered
    upstream.set_total(700);
    gateway
        .resolve(request("foo", &message, "198.51.100.77:40000"))
        .await
        .unwrap();
    assert_eq!(ledger.list("foo", 1).await.unwrap()[0].bytes, -100);

    let err = gateway
        .resolve(request("foo", &message, "198.51.100.77:40000"))
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::Unauthorized));
    assert_eq!(upstream.forwarded().len(), 2);
}
