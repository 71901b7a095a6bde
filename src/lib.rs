//! ZNS metered gateway
//!
//! Prepaid DNS resolver and tunnel proxy. Tokens hold byte tickets in a
//! [`ledger`]; the DoH/DoT fronts in [`dns`] and the CONNECT proxy in
//! [`tunnel`] debit them as traffic flows.

pub mod config;
pub mod dns;
pub mod ledger;
pub mod meter;
pub mod server;
pub mod tickets;
pub mod tls;
pub mod tunnel;

pub use config::GatewayConfig;
pub use server::Gateway;
