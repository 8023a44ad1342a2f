mod cache;
mod codec;
mod config;
mod engine;
mod transport;
mod types;

use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::lookup_host;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::RecordCache;
use crate::codec::DecodedPacket;
use crate::config::{ClientConfig, load_config};
use crate::engine::{Resolver, TraceSink};
use crate::transport::{Transport, UdpTransport};
use crate::types::{RecordType, ResourceRecord, SearchNode};

#[derive(Parser, Debug)]
#[command(author, version, about = "Iterative DNS client that walks delegations itself", long_about = None)]
struct Args {
    /// Hostname or address of the root nameserver
    #[arg(short = 's', long = "server")]
    server: Option<String>,
    /// Print every query and response while resolving
    #[arg(short = 't', long = "trace", default_value_t = false)]
    trace: bool,
    /// Optional JSON config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut cfg = match &args.config {
        Some(path) => load_config(path)?,
        None => ClientConfig::default(),
    };
    if let Some(server) = args.server {
        cfg.root_server = Some(server);
    }
    if args.trace {
        cfg.trace = true;
    }

    let root_name = cfg
        .root_server
        .context("no root server configured (pass --server or set root_server in the config file)")?;
    let root = resolve_root_address(&root_name).await?;

    let transport = UdpTransport::open(Duration::from_millis(cfg.query_timeout_ms))
        .context("open resolver socket")?;

    let cache = Arc::new(RecordCache::new());
    let mut resolver = Resolver::new(root, cache, transport).with_attempts(cfg.query_attempts);
    if cfg.trace {
        resolver = resolver.with_trace_sink(Arc::new(StdoutTrace));
    }

    info!(root = %root, trace = cfg.trace, "resolver ready");
    println!("iterdns interactive client");
    println!("Root server: {root}");

    run_shell(&resolver).await
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// Turns the configured root (hostname or literal) into an address via the
/// system resolver, preferring IPv4. This is the one lookup not done
/// iteratively.
async fn resolve_root_address(host: &str) -> anyhow::Result<IpAddr> {
    let addrs: Vec<SocketAddr> = lookup_host((host.trim(), 0u16))
        .await
        .with_context(|| format!("root address {host:?} could not be resolved"))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.ip().is_ipv4())
        .or_else(|| addrs.first())
        .map(|addr| addr.ip())
        .with_context(|| format!("root address {host:?} resolved to nothing"))
}

async fn run_shell<T: Transport>(resolver: &Resolver<T>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("iterdns> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break; // stdin closed
        };

        let mut words = line.split_whitespace();
        match words.next() {
            None => continue,
            Some("search") => match words.next() {
                Some(hostname) => search_and_print(resolver, hostname).await,
                None => println!("search needs a hostname, e.g. 'search example.com'"),
            },
            Some("help") => print_help(),
            Some("quit") | Some("exit") => break,
            Some(other) => {
                println!("Unknown command '{other}'. Enter 'help' to see a list of commands");
            }
        }
    }

    println!("Goodbye!");
    Ok(())
}

async fn search_and_print<T: Transport>(resolver: &Resolver<T>, hostname: &str) {
    let node = SearchNode::new(hostname, RecordType::A);
    let results = resolver.resolve(hostname, RecordType::A).await;

    if results.is_empty() {
        println!("{:<30} {:<5} {:<8} {}", node.host(), node.rtype(), -1, "0.0.0.0");
    }
    for record in results {
        println!(
            "{:<30} {:<5} {:<8} {}",
            node.host(),
            node.rtype(),
            record.ttl(),
            record.text()
        );
    }
}

fn print_help() {
    println!("Valid commands are:");
    println!("    {:<20} {}", "search <HOSTNAME>", "Resolve a fully qualified domain name");
    println!("    {:<20} {}", "help", "Display this list of commands");
    println!("    {:<20} {}", "quit", "Quit the application");
}

/// Renders the resolution dialogue the way the trace flag promises.
struct StdoutTrace;

impl TraceSink for StdoutTrace {
    fn on_query(&self, id: u16, node: &SearchNode, server: IpAddr) {
        println!("\n\nQuery ID    {} {} {} --> {}", id, node.host(), node.rtype(), server);
    }

    fn on_response(&self, packet: &DecodedPacket) {
        println!(
            "Response ID: {} Authoritative = {}",
            packet.id, packet.flags.authoritative
        );
        print_section("Answers", &packet.answers);
        print_section("Nameservers", &packet.authorities);
        print_section("Additional Information", &packet.additionals);
    }
}

fn print_section(title: &str, records: &[ResourceRecord]) {
    println!("  {} ({})", title, records.len());
    for record in records {
        println!(
            "    {:<30} {:<10} {:<4} {}",
            record.host(),
            record.ttl(),
            record.type_label(),
            record.text()
        );
    }
}
