mod informer;

use anyhow::Context;
use clap::Parser;
use pkg_constants::{dataplane, network, paths, proxy};
use pkg_metrics::MetricsRegistry;
use pkg_proxy::config::{ProxierConfig, ProxyFeatures};
use pkg_proxy::exec::{ExecConntrack, ExecIpSet, ExecIptables, ExecIpvs, ExecNetlink};
use pkg_proxy::fake::{FakeConntrack, FakeIpSet, FakeIptables, FakeIpvs, FakeNetlink, FakePortOpener};
use pkg_proxy::healthcheck::{HttpServiceHealthServer, ProxierHealthServer};
use pkg_proxy::netlink::{InterfaceIpGetter, IpGetter};
use pkg_proxy::port::ListenPortOpener;
use pkg_proxy::proxier::{Backends, Factories, Proxier};
use pkg_types::config::{ProxyConfigFile, load_config_file};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "k3rs-proxy", about = "k3rs IPVS service proxy")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = paths::DEFAULT_PROXY_CONFIG)]
    config: String,

    /// Server API endpoint
    #[arg(long)]
    server: Option<String>,

    /// Bearer token for the API server
    #[arg(long)]
    token: Option<String>,

    /// Node name; defaults to the system hostname
    #[arg(long)]
    hostname: Option<String>,

    /// Seconds between forced syncs
    #[arg(long)]
    sync_period: Option<u64>,

    /// Minimum seconds between two syncs
    #[arg(long)]
    min_sync_period: Option<u64>,

    /// IPVS scheduler (rr, wrr, lc, ...)
    #[arg(long)]
    scheduler: Option<String>,

    /// SNAT all traffic sent to service IPs
    #[arg(long)]
    masquerade_all: bool,

    /// Pod CIDR; traffic from outside it is masqueraded
    #[arg(long)]
    cluster_cidr: Option<String>,

    /// Comma-separated CIDRs selecting node port addresses
    #[arg(long, value_delimiter = ',')]
    node_port_addresses: Vec<String>,

    /// Port for /healthz and /metrics
    #[arg(long)]
    healthz_port: Option<u16>,

    /// Compute rules against in-memory backends without touching the kernel
    #[arg(long)]
    dry_run: bool,
}

fn parse_cidr(cidr: &str) -> anyhow::Result<ipnetwork::IpNetwork> {
    cidr.trim()
        .parse()
        .with_context(|| format!("invalid CIDR {:?}", cidr))
}

fn system_hostname() -> anyhow::Result<String> {
    let name = nix::unistd::gethostname()?;
    Ok(name.to_string_lossy().trim().to_lowercase())
}

/// Merge: CLI args > config file > defaults.
fn build_config(cli: &Cli, file: &ProxyConfigFile) -> anyhow::Result<ProxierConfig> {
    let hostname = match cli.hostname.clone().or_else(|| file.hostname.clone()) {
        Some(h) => h,
        None => system_hostname()?,
    };
    let cluster_cidr = cli
        .cluster_cidr
        .as_deref()
        .or(file.cluster_cidr.as_deref())
        .map(parse_cidr)
        .transpose()?;
    let exclude_cidrs = file
        .exclude_cidrs
        .iter()
        .flatten()
        .map(|c| parse_cidr(c))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let node_port_addresses = if cli.node_port_addresses.is_empty() {
        file.node_port_addresses.clone().unwrap_or_default()
    } else {
        cli.node_port_addresses.clone()
    };
    for cidr in &node_port_addresses {
        parse_cidr(cidr)?;
    }

    let defaults = ProxierConfig::default();
    let features = ProxyFeatures {
        internal_traffic_policy: file
            .features
            .internal_traffic_policy
            .unwrap_or(defaults.features.internal_traffic_policy),
        topology_aware_hints: file
            .features
            .topology_aware_hints
            .unwrap_or(defaults.features.topology_aware_hints),
        terminating_endpoints_fallback: file
            .features
            .terminating_endpoints_fallback
            .unwrap_or(defaults.features.terminating_endpoints_fallback),
    };

    Ok(ProxierConfig {
        hostname,
        ip_family: file.ip_family.unwrap_or(defaults.ip_family),
        node_ip: None,
        sync_period: cli
            .sync_period
            .or(file.sync_period)
            .map(Duration::from_secs)
            .unwrap_or(proxy::DEFAULT_SYNC_PERIOD),
        min_sync_period: cli
            .min_sync_period
            .or(file.min_sync_period)
            .map(Duration::from_secs)
            .unwrap_or(proxy::DEFAULT_MIN_SYNC_PERIOD),
        scheduler: cli
            .scheduler
            .clone()
            .or_else(|| file.scheduler.clone())
            .unwrap_or(defaults.scheduler),
        masquerade_all: cli.masquerade_all || file.masquerade_all.unwrap_or(false),
        masquerade_bit: file.masquerade_bit.unwrap_or(defaults.masquerade_bit),
        cluster_cidr,
        node_port_addresses,
        exclude_cidrs,
        dummy_device: dataplane::DEFAULT_DUMMY_DEVICE.to_string(),
        graceful_termination_timeout: file
            .graceful_termination_timeout
            .map(Duration::from_secs)
            .unwrap_or(defaults.graceful_termination_timeout),
        rs_check_interval: defaults.rs_check_interval,
        features,
    })
}

fn backends(config: &ProxierConfig, dry_run: bool) -> Backends {
    let ip_getter = Arc::new(InterfaceIpGetter::new(config.dummy_device.clone()));
    let health = Arc::new(HttpServiceHealthServer::new(None));
    if dry_run {
        return Backends {
            ipvs: Arc::new(FakeIpvs::default()),
            ipset: Arc::new(FakeIpSet::default()),
            iptables: Arc::new(FakeIptables::default()),
            netlink: Arc::new(FakeNetlink::default()),
            port_opener: Arc::new(FakePortOpener::default()),
            conntrack: Arc::new(FakeConntrack::default()),
            ip_getter,
            health,
        };
    }
    Backends {
        ipvs: Arc::new(ExecIpvs),
        ipset: Arc::new(ExecIpSet),
        iptables: Arc::new(ExecIptables::new(config.ip_family)),
        netlink: Arc::new(ExecNetlink),
        port_opener: Arc::new(ListenPortOpener),
        conntrack: Arc::new(ExecConntrack),
        ip_getter,
        health,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: ProxyConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    let mut config = build_config(&cli, &file_cfg)?;
    let ip_getter = InterfaceIpGetter::new(config.dummy_device.clone());
    match ip_getter.node_ips() {
        Ok(ips) => {
            config.node_ip = ips
                .into_iter()
                .find(|ip| config.ip_family.matches(ip) && !ip.is_loopback());
        }
        Err(e) => warn!("failed to detect node IP: {}", e),
    }

    let server = cli
        .server
        .clone()
        .or(file_cfg.server.clone())
        .unwrap_or_else(|| network::DEFAULT_API_ADDR.to_string());
    let token = cli.token.clone().or(file_cfg.token.clone()).unwrap_or_default();
    let healthz_port = cli
        .healthz_port
        .or(file_cfg.healthz_port)
        .unwrap_or(network::DEFAULT_SERVICE_PROXY_PORT);

    info!("Starting k3rs-proxy");
    info!("  Node:      {}", config.hostname);
    info!("  Server:    {}", server);
    info!("  Family:    {}", config.ip_family);
    info!("  Scheduler: {}", config.scheduler);
    if let Some(ip) = config.node_ip {
        info!("  Node IP:   {}", ip);
    }
    if cli.dry_run {
        warn!("dry run: rules are computed against in-memory backends only");
    }

    let metrics = Arc::new(MetricsRegistry::new());
    let healthz_ip: IpAddr = network::DEFAULT_HEALTHZ_BIND_ADDR.parse()?;
    let healthz = Arc::new(ProxierHealthServer::new(
        SocketAddr::new(healthz_ip, healthz_port),
        config.sync_period * 2,
        metrics.clone(),
    ));

    let backends = backends(&config, cli.dry_run);
    let proxier = Arc::new(
        Proxier::new(config, backends, metrics, Factories::default())
            .with_health_server(healthz.clone()),
    );

    let _tasks = proxier.sync_runner();

    tokio::spawn(async move {
        if let Err(e) = healthz.run().await {
            error!("proxy health server failed: {}", e);
        }
    });

    let informer = informer::Informer::new(&server, &token, &proxier.config().hostname)?;
    tokio::spawn(informer.run(proxier.clone(), proxy::DEFAULT_POLL_INTERVAL));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down k3rs-proxy");
    Ok(())
}
