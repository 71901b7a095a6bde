//! ZNS Gateway Entry Point
//!
//! Runs the metered resolver and tunnel proxy:
//! - HTTPS (h2 + http/1.1): DoH, CONNECT / CONNECT-UDP tunnels, ticket API
//! - plain HTTP, for use behind a TLS-terminating ingress
//! - DNS over TLS
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file
//! zns --config /etc/zns/zns.toml
//!
//! # Show the effective configuration and exit
//! zns --config /etc/zns/zns.yaml --print-config
//!
//! # Local testing without certificates or a database
//! zns --no-https --http-listen 127.0.0.1:8080 --free
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::future::{BoxFuture, FutureExt};
use hyper::header::{HeaderName, HeaderValue};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use zns_gateway::config::GatewayConfig;
use zns_gateway::dns::{
    Blocklist, DomainBlocklist, DotServer, HttpsUpstream, NoBlocklist, ResolverGateway,
};
use zns_gateway::ledger::{FreeLedger, Ledger, SqliteLedger};
use zns_gateway::server::{self, Gateway};
use zns_gateway::tickets::TicketApi;
use zns_gateway::tls::{build_server_config, DOT_ALPN, HTTPS_ALPN};
use zns_gateway::tunnel::TunnelProxy;

/// ZNS metered gateway
#[derive(Parser, Debug)]
#[command(name = "zns")]
#[command(version)]
#[command(about = "Prepaid DNS over HTTPS/TLS resolver and tunnel proxy", long_about = None)]
struct Args {
    /// Path to configuration file (TOML, or YAML for .yaml/.yml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTPS listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Disable the HTTPS listener
    #[arg(long)]
    no_https: bool,

    /// Plain HTTP listen address
    #[arg(long)]
    http_listen: Option<SocketAddr>,

    /// DNS over TLS listen address
    #[arg(long)]
    dot_listen: Option<SocketAddr>,

    /// TLS certificate chain (PEM)
    #[arg(long)]
    tls_cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    tls_key: Option<String>,

    /// SQLite ticket database
    #[arg(long)]
    db: Option<String>,

    /// Free mode: every token has a fixed balance, nothing is persisted
    #[arg(long)]
    free: bool,

    /// Upstream DoH endpoint
    #[arg(long)]
    upstream: Option<String>,

    /// Ad-domain list for `noad` queries
    #[arg(long)]
    blocklist: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting ZNS gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if let Some(config_path) = &args.config {
        GatewayConfig::load(config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        GatewayConfig::default()
    };
    let print_config = args.print_config;
    apply_args(&mut config, args);
    config.validate()?;

    if print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let ledger: Arc<dyn Ledger> = if config.ledger.free {
        info!("Free mode: tickets are not persisted");
        Arc::new(FreeLedger::new())
    } else {
        info!("Ticket database: {}", config.ledger.db_path);
        Arc::new(SqliteLedger::open(&config.ledger.db_path)?)
    };

    let blocklist: Arc<dyn Blocklist> = match &config.resolver.blocklist_path {
        Some(path) => Arc::new(
            DomainBlocklist::load(path).with_context(|| format!("Failed to load {}", path))?,
        ),
        None => Arc::new(NoBlocklist),
    };

    let resolver = ResolverGateway::new(
        ledger.clone(),
        Arc::new(HttpsUpstream::new(config.resolver.upstream.clone())),
    )
    .with_blocklist(blocklist)
    .with_failover_multiplier(config.resolver.failover_multiplier);

    let tunnel = TunnelProxy::new(ledger.clone(), config.tunnel.clone());
    let tickets = TicketApi::new(ledger, config.tickets.mib_per_cny);

    let mut gateway = Gateway::new(resolver.clone(), tunnel, tickets)
        .with_failover_header(HeaderName::from_bytes(
            config.resolver.failover_header.as_bytes(),
        )?);
    if let Some(alt_svc) = &config.server.alt_svc {
        gateway = gateway.with_alt_svc(HeaderValue::from_str(alt_svc)?);
    }
    let gateway = Arc::new(gateway);

    info!("Gateway configuration:");
    info!("  Upstream: {}", config.resolver.upstream);
    info!("  Tunnel cost multiplier: {}", config.tunnel.cost_multiplier);
    info!("  Failover multiplier: {}", config.resolver.failover_multiplier);

    let mut listeners: Vec<BoxFuture<'static, anyhow::Result<()>>> = Vec::new();

    if let Some(addr) = config.server.https_addr {
        let tls_config = Arc::new(build_server_config(
            cert_path(&config)?,
            key_path(&config)?,
            HTTPS_ALPN,
        )?);
        let listener = server::bind(addr).await?;
        let gateway = gateway.clone();
        listeners.push(
            async move { Ok(server::serve_https(gateway, listener, tls_config).await?) }.boxed(),
        );
    }

    if let Some(addr) = config.server.http_addr {
        let listener = server::bind(addr).await?;
        let gateway = gateway.clone();
        listeners.push(async move { Ok(server::serve_http(gateway, listener).await?) }.boxed());
    }

    if let Some(addr) = config.server.dot_addr {
        let tls_config = Arc::new(build_server_config(
            cert_path(&config)?,
            key_path(&config)?,
            DOT_ALPN,
        )?);
        let dot = DotServer::new(addr, tls_config, resolver);
        listeners.push(async move { Ok(dot.run().await?) }.boxed());
    }

    futures::future::try_join_all(listeners).await?;
    Ok(())
}

/// Command line arguments override the config file
fn apply_args(config: &mut GatewayConfig, args: Args) {
    if args.no_https {
        config.server.https_addr = None;
    } else if let Some(addr) = args.listen {
        config.server.https_addr = Some(addr);
    }
    if args.http_listen.is_some() {
        config.server.http_addr = args.http_listen;
    }
    if args.dot_listen.is_some() {
        config.server.dot_addr = args.dot_listen;
    }
    if args.tls_cert.is_some() {
        config.server.cert_path = args.tls_cert;
    }
    if args.tls_key.is_some() {
        config.server.key_path = args.tls_key;
    }
    if let Some(db) = args.db {
        config.ledger.db_path = db;
    }
    if args.free {
        config.ledger.free = true;
    }
    if let Some(upstream) = args.upstream {
        config.resolver.upstream = upstream;
    }
    if args.blocklist.is_some() {
        config.resolver.blocklist_path = args.blocklist;
    }
}

fn cert_path(config: &GatewayConfig) -> anyhow::Result<&str> {
    config
        .server
        .cert_path
        .as_deref()
        .context("server.cert_path is not set")
}

fn key_path(config: &GatewayConfig) -> anyhow::Result<&str> {
    config
        .server
        .key_path
        .as_deref()
        .context("server.key_path is not set")
}
