use anyhow::Result;
use async_trait::async_trait;
use pkg_types::meta::Protocol;
use std::net::IpAddr;

/// Session affinity: all connections from a client go to the same real server.
pub const FLAG_PERSISTENT: u32 = 0x1;
/// Set by the kernel on every listed virtual server; ignored on compare.
pub const FLAG_HASHED: u32 = 0x2;

/// An IPVS virtual service: `address:port/protocol` plus scheduling options.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualServer {
    pub address: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub scheduler: String,
    pub flags: u32,
    /// Persistence timeout in seconds, meaningful with [`FLAG_PERSISTENT`].
    pub timeout: u32,
}

impl VirtualServer {
    pub fn new(address: IpAddr, port: u16, protocol: Protocol, scheduler: &str) -> Self {
        Self {
            address,
            port,
            protocol,
            scheduler: scheduler.to_string(),
            flags: 0,
            timeout: 0,
        }
    }

    /// Enable client-IP persistence with the given timeout.
    pub fn with_affinity(mut self, timeout: Option<u32>) -> Self {
        if let Some(timeout) = timeout {
            self.flags |= FLAG_PERSISTENT;
            self.timeout = timeout;
        }
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.flags & FLAG_PERSISTENT != 0
    }

    /// Compare everything the proxy controls, ignoring kernel-set flags.
    pub fn same_config(&self, other: &VirtualServer) -> bool {
        self.address == other.address
            && self.port == other.port
            && self.protocol == other.protocol
            && self.scheduler == other.scheduler
            && (self.flags & !FLAG_HASHED) == (other.flags & !FLAG_HASHED)
            && self.timeout == other.timeout
    }
}

impl std::fmt::Display for VirtualServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            IpAddr::V6(ip) => write!(f, "[{}]:{}/{}", ip, self.port, self.protocol),
            IpAddr::V4(ip) => write!(f, "{}:{}/{}", ip, self.port, self.protocol),
        }
    }
}

/// A backend destination of a virtual server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RealServer {
    pub address: IpAddr,
    pub port: u16,
    pub weight: i32,
    pub active_connections: u32,
    pub inactive_connections: u32,
}

impl RealServer {
    pub fn new(address: IpAddr, port: u16, weight: i32) -> Self {
        Self {
            address,
            port,
            weight,
            active_connections: 0,
            inactive_connections: 0,
        }
    }

    /// Destinations are identified by address and port only.
    pub fn same_destination(&self, other: &RealServer) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl std::fmt::Display for RealServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
        }
    }
}

/// Key identifying a real server under a virtual server, `vs/rs`.
pub fn unique_rs_name(vs: &VirtualServer, rs: &RealServer) -> String {
    format!("{}/{}", vs, rs)
}

/// Kernel IPVS table access.
#[async_trait]
pub trait Ipvs: Send + Sync {
    /// List every installed virtual server.
    async fn virtual_servers(&self) -> Result<Vec<VirtualServer>>;

    async fn add_virtual_server(&self, vs: &VirtualServer) -> Result<()>;

    /// Replace the scheduler, flags and timeout of an existing virtual server.
    async fn update_virtual_server(&self, vs: &VirtualServer) -> Result<()>;

    async fn delete_virtual_server(&self, vs: &VirtualServer) -> Result<()>;

    /// List destinations of a virtual server, with connection counters.
    async fn real_servers(&self, vs: &VirtualServer) -> Result<Vec<RealServer>>;

    async fn add_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()>;

    /// Change the weight of an existing destination.
    async fn update_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()>;

    async fn delete_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()>;

    /// Active plus inactive connections of one destination.
    ///
    /// Errors if the destination no longer exists.
    async fn connection_count(&self, vs: &VirtualServer, rs: &RealServer) -> Result<u64> {
        let servers = self.real_servers(vs).await?;
        servers
            .iter()
            .find(|s| s.same_destination(rs))
            .map(|s| s.active_connections as u64 + s.inactive_connections as u64)
            .ok_or_else(|| anyhow::anyhow!("real server {} not found under {}", rs, vs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_vs() -> VirtualServer {
        VirtualServer::new("10.0.0.5".parse().unwrap(), 80, Protocol::Tcp, "rr")
    }

    #[test]
    fn display_formats() {
        let vs = make_vs();
        let rs = RealServer::new("10.1.1.1".parse().unwrap(), 8080, 1);
        assert_eq!(vs.to_string(), "10.0.0.5:80/TCP");
        assert_eq!(unique_rs_name(&vs, &rs), "10.0.0.5:80/TCP/10.1.1.1:8080");

        let v6 = VirtualServer::new("fd00::5".parse().unwrap(), 53, Protocol::Udp, "rr");
        assert_eq!(v6.to_string(), "[fd00::5]:53/UDP");
    }

    #[test]
    fn hashed_flag_is_ignored() {
        let vs = make_vs().with_affinity(Some(10800));
        let mut listed = vs.clone();
        listed.flags |= FLAG_HASHED;
        assert!(vs.is_persistent());
        assert!(vs.same_config(&listed));

        let mut other_sched = vs.clone();
        other_sched.scheduler = "wrr".into();
        assert!(!vs.same_config(&other_sched));
    }

    #[test]
    fn destinations_ignore_weight() {
        let a = RealServer::new("10.1.1.1".parse().unwrap(), 8080, 1);
        let b = RealServer::new("10.1.1.1".parse().unwrap(), 8080, 0);
        assert!(a.same_destination(&b));
        assert_ne!(a, b);
    }
}
