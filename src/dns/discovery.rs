//! `_dns.` SVCB discovery (DDR, RFC 9461/9462)
//!
//! Clients ask for `_dns.<server>` SVCB records to learn which encrypted
//! transports the gateway offers for their token. The answer is synthesized
//! locally: a DoH endpoint at priority 1 and a DoT endpoint at priority 2.
//!
//! The DoH record lists `h3` alongside `h2`. HTTP/3 is served by an external
//! front, not by this crate.

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::svcb::{Alpn, SvcParamKey, SvcParamValue, Unknown, SVCB};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::ProtoError;

use super::TokenSource;

const DISCOVERY_LABEL: &[u8] = b"_dns";

/// SvcParamKey for `dohpath` (RFC 9461)
const DOHPATH_KEY: u16 = 7;

const DISCOVERY_TTL: u32 = 1;

/// Whether `query` asks for the gateway's own discovery records
pub fn is_discovery_query(query: &Query) -> bool {
    query.query_type() == RecordType::SVCB
        && query
            .name()
            .iter()
            .next()
            .map_or(false, |label| label.eq_ignore_ascii_case(DISCOVERY_LABEL))
}

/// DoH and DoT target names for `server`
pub fn targets(server: &Name, token: &str, source: TokenSource) -> Result<(Name, Name), ProtoError> {
    match source {
        TokenSource::Path => Ok((server.clone(), server.prepend_label(token)?)),
        TokenSource::Host => {
            let starts_with_token = server
                .iter()
                .next()
                .map_or(false, |label| label.eq_ignore_ascii_case(token.as_bytes()));
            let doh = if starts_with_token {
                server.base_name()
            } else {
                server.clone()
            };
            Ok((doh, server.clone()))
        }
    }
}

/// Authoritative answer with the two discovery SVCB records
pub fn discovery_response(
    request: &Message,
    query: &Query,
    token: &str,
    source: TokenSource,
) -> Result<Message, ProtoError> {
    let server = query.name().base_name();
    let (doh_target, dot_target) = targets(&server, token, source)?;

    let doh = SVCB::new(
        1,
        doh_target,
        vec![
            (
                SvcParamKey::Alpn,
                SvcParamValue::Alpn(Alpn(vec!["h3".to_string(), "h2".to_string()])),
            ),
            (
                SvcParamKey::from(DOHPATH_KEY),
                SvcParamValue::Unknown(Unknown(format!("/dns/{}/{{?dns}}", token).into_bytes())),
            ),
        ],
    );
    let dot = SVCB::new(
        2,
        dot_target,
        vec![(
            SvcParamKey::Alpn,
            SvcParamValue::Alpn(Alpn(vec!["dot".to_string()])),
        )],
    );

    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_authoritative(true);
    response.set_response_code(ResponseCode::NoError);
    response.add_query(query.clone());
    response.add_answer(Record::from_rdata(
        query.name().clone(),
        DISCOVERY_TTL,
        RData::SVCB(doh),
    ));
    response.add_answer(Record::from_rdata(
        query.name().clone(),
        DISCOVERY_TTL,
        RData::SVCB(dot),
    ));

    Ok(response)
}
