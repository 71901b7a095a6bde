//! EDNS Client-Subnet rewriting
//!
//! A query keeps a client subnet it already carries unless the option is
//! degenerate (zero prefix or unspecified address). Otherwise the gateway
//! synthesizes one from the caller's address, truncated to /24 for IPv4 and
//! /48 for IPv6. Padding options are dropped since the message is re-encoded
//! for a different transport.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};

pub const IPV4_SOURCE_PREFIX: u8 = 24;
pub const IPV6_SOURCE_PREFIX: u8 = 48;

/// Max UDP payload advertised when the gateway adds the OPT record itself
pub const DEFAULT_MAX_PAYLOAD: u16 = 4096;

/// ECS address family (RFC 7871): 1 for IPv4, 2 for IPv6
pub fn family(addr: IpAddr) -> u16 {
    match addr {
        IpAddr::V4(_) => 1,
        IpAddr::V6(_) => 2,
    }
}

/// Client subnet synthesized from a caller address
pub fn client_subnet(addr: IpAddr) -> ClientSubnet {
    match canonical(addr) {
        IpAddr::V4(v4) => ClientSubnet::new(
            IpAddr::V4(mask_v4(v4, IPV4_SOURCE_PREFIX)),
            IPV4_SOURCE_PREFIX,
            0,
        ),
        IpAddr::V6(v6) => ClientSubnet::new(
            IpAddr::V6(mask_v6(v6, IPV6_SOURCE_PREFIX)),
            IPV6_SOURCE_PREFIX,
            0,
        ),
    }
}

/// Whether an existing subnet option carries no usable information
pub fn is_degenerate(subnet: &ClientSubnet) -> bool {
    subnet.source_prefix() == 0 || subnet.addr().is_unspecified()
}

/// Rewrite the query's EDNS section for forwarding on behalf of `client`
pub fn apply(message: &mut Message, client: IpAddr) {
    let edns = message.extensions_mut().get_or_insert_with(|| {
        let mut edns = Edns::new();
        edns.set_max_payload(DEFAULT_MAX_PAYLOAD);
        edns
    });

    edns.options_mut().remove(EdnsCode::Padding);

    let keep = matches!(
        edns.option(EdnsCode::Subnet),
        Some(EdnsOption::Subnet(subnet)) if !is_degenerate(subnet)
    );
    if !keep {
        edns.options_mut().remove(EdnsCode::Subnet);
        edns.options_mut()
            .insert(EdnsOption::Subnet(client_subnet(client)));
    }
}

/// IPv4-mapped IPv6 addresses are treated as IPv4
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn mask_v4(addr: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    Ipv4Addr::from(u32::from(addr) & mask)
}

fn mask_v6(addr: Ipv6Addr, prefix: u8) -> Ipv6Addr {
    let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
    Ipv6Addr::from(u128::from(addr) & mask)
}
