use anyhow::Result;
use async_trait::async_trait;
use pkg_constants::dataplane as dp;
use pkg_types::meta::IpFamily;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tracing::{error, info};

/// Kind of an ipset, deciding the entry format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetType {
    /// `ip,proto:port`
    HashIpPort,
    /// `ip,proto:port,ip2`
    HashIpPortIp,
    /// `ip,proto:port,net`
    HashIpPortNet,
    /// `port`
    BitmapPort,
}

impl SetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetType::HashIpPort => "hash:ip,port",
            SetType::HashIpPortIp => "hash:ip,port,ip",
            SetType::HashIpPortNet => "hash:ip,port,net",
            SetType::BitmapPort => "bitmap:port",
        }
    }
}

/// An ipset definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSet {
    pub name: String,
    pub set_type: SetType,
    pub family: IpFamily,
    pub comment: String,
}

impl IpSet {
    /// `ipset create` arguments after the set name.
    pub fn create_args(&self) -> Vec<String> {
        let mut args = vec![self.set_type.as_str().to_string()];
        match self.set_type {
            SetType::BitmapPort => {
                args.extend(["range".to_string(), "0-65535".to_string()]);
            }
            _ => {
                let family = match self.family {
                    IpFamily::IPv4 => "inet",
                    IpFamily::IPv6 => "inet6",
                };
                args.extend(["family".to_string(), family.to_string()]);
            }
        }
        args.extend(["comment".to_string(), self.comment.clone()]);
        args
    }
}

/// One member of an ipset. Which fields are used depends on `set_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub ip: String,
    pub port: u16,
    /// Lowercase protocol name.
    pub protocol: String,
    pub ip2: String,
    pub net: String,
    pub set_type: SetType,
}

impl Entry {
    pub fn ip_port(ip: &str, port: u16, protocol: &str) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            protocol: protocol.to_string(),
            ip2: String::new(),
            net: String::new(),
            set_type: SetType::HashIpPort,
        }
    }

    pub fn ip_port_ip(ip: &str, port: u16, protocol: &str, ip2: &str) -> Self {
        Self {
            ip2: ip2.to_string(),
            set_type: SetType::HashIpPortIp,
            ..Self::ip_port(ip, port, protocol)
        }
    }

    pub fn ip_port_net(ip: &str, port: u16, protocol: &str, net: &str) -> Self {
        Self {
            net: net.to_string(),
            set_type: SetType::HashIpPortNet,
            ..Self::ip_port(ip, port, protocol)
        }
    }

    pub fn port(port: u16, protocol: &str) -> Self {
        Self {
            set_type: SetType::BitmapPort,
            ..Self::ip_port("", port, protocol)
        }
    }
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.set_type {
            SetType::HashIpPort => write!(f, "{},{}:{}", self.ip, self.protocol, self.port),
            SetType::HashIpPortIp => write!(
                f,
                "{},{}:{},{}",
                self.ip, self.protocol, self.port, self.ip2
            ),
            SetType::HashIpPortNet => write!(
                f,
                "{},{}:{},{}",
                self.ip, self.protocol, self.port, self.net
            ),
            SetType::BitmapPort => write!(f, "{}", self.port),
        }
    }
}

/// ipset command access.
#[async_trait]
pub trait IpSetBackend: Send + Sync {
    /// Create the set if missing.
    async fn ensure_set(&self, set: &IpSet) -> Result<()>;

    /// List members of a set in their textual form.
    async fn list_entries(&self, set: &str) -> Result<Vec<String>>;

    async fn add_entry(&self, set: &str, entry: &str) -> Result<()>;

    async fn del_entry(&self, set: &str, entry: &str) -> Result<()>;
}

/// A set plus the entries the current sync pass wants in it.
#[derive(Debug, Clone)]
pub struct ProxyIpSet {
    pub set: IpSet,
    pub active_entries: BTreeSet<String>,
}

impl ProxyIpSet {
    pub fn new(name: &str, set_type: SetType, family: IpFamily, comment: &str) -> Self {
        Self {
            set: IpSet {
                name: name.to_string(),
                set_type,
                family,
                comment: comment.to_string(),
            },
            active_entries: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active_entries.is_empty()
    }

    /// Check `entry` against the set's type and family.
    pub fn validate_entry(&self, entry: &Entry) -> bool {
        if entry.set_type != self.set.set_type {
            return false;
        }
        if entry.port == 0 {
            return false;
        }
        if !matches!(entry.protocol.as_str(), "tcp" | "udp" | "sctp") {
            return false;
        }
        match entry.set_type {
            SetType::BitmapPort => true,
            SetType::HashIpPort => self.valid_ip(&entry.ip),
            SetType::HashIpPortIp => self.valid_ip(&entry.ip) && self.valid_ip(&entry.ip2),
            SetType::HashIpPortNet => {
                self.valid_ip(&entry.ip)
                    && entry
                        .net
                        .parse::<ipnetwork::IpNetwork>()
                        .is_ok_and(|n| self.set.family.matches(&n.ip()))
            }
        }
    }

    fn valid_ip(&self, ip: &str) -> bool {
        ip.parse::<IpAddr>()
            .is_ok_and(|ip| self.set.family.matches(&ip))
    }

    /// Validate and stage an entry. Returns false (and logs) if invalid.
    pub fn insert(&mut self, entry: &Entry) -> bool {
        if !self.validate_entry(entry) {
            error!("invalid entry {} for ipset {}", entry, self.set.name);
            return false;
        }
        self.active_entries.insert(entry.to_string());
        true
    }

    /// Add missing and delete extra members so the set equals `active_entries`.
    pub async fn sync_entries(&self, backend: &dyn IpSetBackend) {
        let current: BTreeSet<String> = match backend.list_entries(&self.set.name).await {
            Ok(entries) => entries.into_iter().collect(),
            Err(e) => {
                error!("failed to list entries of ipset {}: {}", self.set.name, e);
                BTreeSet::new()
            }
        };
        for stale in current.difference(&self.active_entries) {
            match backend.del_entry(&self.set.name, stale).await {
                Ok(()) => info!("deleted {} from ipset {}", stale, self.set.name),
                Err(e) => error!("failed to delete {} from ipset {}: {}", stale, self.set.name, e),
            }
        }
        for missing in self.active_entries.difference(&current) {
            if let Err(e) = backend.add_entry(&self.set.name, missing).await {
                error!("failed to add {} to ipset {}: {}", missing, self.set.name, e);
            }
        }
    }
}

/// Every ipset the proxy maintains, keyed by name.
pub fn proxy_ipsets(family: IpFamily) -> BTreeMap<&'static str, ProxyIpSet> {
    let defs: [(&'static str, SetType, &str); 16] = [
        (dp::LOOP_BACK_IP_SET, SetType::HashIpPortIp, "k3rs endpoint dst ip:port, source ip for solving hairpin purpose"),
        (dp::CLUSTER_IP_SET, SetType::HashIpPort, "k3rs service cluster ip + port for masquerade purpose"),
        (dp::EXTERNAL_IP_SET, SetType::HashIpPort, "k3rs service external ip + port for masquerade and filter purpose"),
        (dp::EXTERNAL_IP_LOCAL_SET, SetType::HashIpPort, "k3rs service external ip + port with externalTrafficPolicy=local"),
        (dp::LOAD_BALANCER_SET, SetType::HashIpPort, "k3rs service lb portal"),
        (dp::LOAD_BALANCER_FW_SET, SetType::HashIpPort, "k3rs service load balancer ip + port for load balancer with sourceRange"),
        (dp::LOAD_BALANCER_LOCAL_SET, SetType::HashIpPort, "k3rs service load balancer ip + port with externalTrafficPolicy=local"),
        (dp::LOAD_BALANCER_SOURCE_IP_SET, SetType::HashIpPortIp, "k3rs service load balancer ip + port + source IP for packet filter purpose"),
        (dp::LOAD_BALANCER_SOURCE_CIDR_SET, SetType::HashIpPortNet, "k3rs service load balancer ip + port + source cidr for packet filter purpose"),
        (dp::NODE_PORT_TCP_SET, SetType::BitmapPort, "k3rs nodeport TCP port for masquerade purpose"),
        (dp::NODE_PORT_LOCAL_TCP_SET, SetType::BitmapPort, "k3rs nodeport TCP port with externalTrafficPolicy=local"),
        (dp::NODE_PORT_UDP_SET, SetType::BitmapPort, "k3rs nodeport UDP port for masquerade purpose"),
        (dp::NODE_PORT_LOCAL_UDP_SET, SetType::BitmapPort, "k3rs nodeport UDP port with externalTrafficPolicy=local"),
        (dp::NODE_PORT_SCTP_SET, SetType::HashIpPort, "k3rs nodeport SCTP port for masquerade purpose with type 'hash ip:port'"),
        (dp::NODE_PORT_LOCAL_SCTP_SET, SetType::HashIpPort, "k3rs nodeport SCTP port with externalTrafficPolicy=local with type 'hash ip:port'"),
        (dp::HEALTH_CHECK_NODE_PORT_SET, SetType::BitmapPort, "k3rs health check node port"),
    ];
    defs.into_iter()
        .map(|(name, set_type, comment)| (name, ProxyIpSet::new(name, set_type, family, comment)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_formats() {
        assert_eq!(Entry::ip_port("10.0.0.5", 80, "tcp").to_string(), "10.0.0.5,tcp:80");
        assert_eq!(
            Entry::ip_port_ip("10.1.1.1", 8080, "tcp", "10.1.1.1").to_string(),
            "10.1.1.1,tcp:8080,10.1.1.1"
        );
        assert_eq!(
            Entry::ip_port_net("5.6.7.8", 80, "tcp", "192.168.0.0/16").to_string(),
            "5.6.7.8,tcp:80,192.168.0.0/16"
        );
        assert_eq!(Entry::port(30080, "udp").to_string(), "30080");
    }

    #[test]
    fn validation_checks_type_and_family() {
        let set = ProxyIpSet::new("S", SetType::HashIpPort, IpFamily::IPv4, "c");
        assert!(set.validate_entry(&Entry::ip_port("10.0.0.5", 80, "tcp")));
        assert!(!set.validate_entry(&Entry::ip_port("fd00::5", 80, "tcp")));
        assert!(!set.validate_entry(&Entry::ip_port("10.0.0.5", 0, "tcp")));
        assert!(!set.validate_entry(&Entry::ip_port("10.0.0.5", 80, "icmp")));
        assert!(!set.validate_entry(&Entry::port(80, "tcp")));

        let nets = ProxyIpSet::new("N", SetType::HashIpPortNet, IpFamily::IPv4, "c");
        assert!(nets.validate_entry(&Entry::ip_port_net("5.6.7.8", 80, "tcp", "10.0.0.0/8")));
        assert!(!nets.validate_entry(&Entry::ip_port_net("5.6.7.8", 80, "tcp", "10.0.0.0")));
    }

    #[test]
    fn create_args_by_type() {
        let sets = proxy_ipsets(IpFamily::IPv6);
        assert_eq!(sets.len(), 16);
        let cluster = &sets[dp::CLUSTER_IP_SET].set;
        assert_eq!(&cluster.create_args()[..3], ["hash:ip,port", "family", "inet6"]);
        let hc = &sets[dp::HEALTH_CHECK_NODE_PORT_SET].set;
        assert_eq!(&hc.create_args()[..3], ["bitmap:port", "range", "0-65535"]);
    }

    #[tokio::test]
    async fn sync_adds_and_removes() {
        let backend = crate::fake::FakeIpSet::default();
        let mut set = ProxyIpSet::new(dp::CLUSTER_IP_SET, SetType::HashIpPort, IpFamily::IPv4, "c");
        backend.ensure_set(&set.set).await.unwrap();
        backend.add_entry(dp::CLUSTER_IP_SET, "10.0.0.9,tcp:80").await.unwrap();

        set.insert(&Entry::ip_port("10.0.0.5", 80, "tcp"));
        set.sync_entries(&backend).await;
        assert_eq!(
            backend.list_entries(dp::CLUSTER_IP_SET).await.unwrap(),
            vec!["10.0.0.5,tcp:80".to_string()]
        );
    }
}
