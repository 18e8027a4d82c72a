use ipnetwork::IpNetwork;
use pkg_constants::{dataplane, network, proxy};
use pkg_types::meta::IpFamily;
use std::time::Duration;

/// Optional proxy behaviours. All default to enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyFeatures {
    /// Honour `internalTrafficPolicy: Local` on cluster IPs.
    pub internal_traffic_policy: bool,
    /// Filter endpoints by zone hints when a service asks for it.
    pub topology_aware_hints: bool,
    /// Route node-local traffic to serving-but-terminating endpoints when no
    /// ready local endpoint is left.
    pub terminating_endpoints_fallback: bool,
}

impl Default for ProxyFeatures {
    fn default() -> Self {
        Self {
            internal_traffic_policy: true,
            topology_aware_hints: true,
            terminating_endpoints_fallback: true,
        }
    }
}

/// Static settings of one proxier instance.
#[derive(Debug, Clone)]
pub struct ProxierConfig {
    /// Name of this node; endpoints with the same node name are local.
    pub hostname: String,
    pub ip_family: IpFamily,
    /// Primary node IP, used for load-balancer source range checks.
    pub node_ip: Option<std::net::IpAddr>,
    pub sync_period: Duration,
    pub min_sync_period: Duration,
    pub scheduler: String,
    pub masquerade_all: bool,
    pub masquerade_bit: u32,
    pub cluster_cidr: Option<IpNetwork>,
    /// CIDRs selecting which node addresses serve node ports. Empty means all.
    pub node_port_addresses: Vec<String>,
    /// Virtual servers inside these ranges are never cleaned up.
    pub exclude_cidrs: Vec<IpNetwork>,
    pub dummy_device: String,
    pub graceful_termination_timeout: Duration,
    pub rs_check_interval: Duration,
    pub features: ProxyFeatures,
}

impl Default for ProxierConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            ip_family: IpFamily::IPv4,
            node_ip: None,
            sync_period: proxy::DEFAULT_SYNC_PERIOD,
            min_sync_period: proxy::DEFAULT_MIN_SYNC_PERIOD,
            scheduler: proxy::DEFAULT_SCHEDULER.to_string(),
            masquerade_all: false,
            masquerade_bit: network::DEFAULT_MASQUERADE_BIT,
            cluster_cidr: None,
            node_port_addresses: Vec::new(),
            exclude_cidrs: Vec::new(),
            dummy_device: dataplane::DEFAULT_DUMMY_DEVICE.to_string(),
            graceful_termination_timeout: proxy::RS_GRACEFUL_TIMEOUT,
            rs_check_interval: proxy::RS_CHECK_DELETE_INTERVAL,
            features: ProxyFeatures::default(),
        }
    }
}

impl ProxierConfig {
    /// Packet mark used to flag traffic that needs SNAT, as `0x...`.
    pub fn masquerade_mark(&self) -> String {
        format!("{:#010x}", 1u32 << self.masquerade_bit.min(31))
    }

    pub fn is_excluded(&self, ip: &std::net::IpAddr) -> bool {
        self.exclude_cidrs.iter().any(|cidr| cidr.contains(*ip))
    }
}
