use anyhow::Result;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use pkg_types::validate::is_zero_cidr;
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Link and address management for the dummy device holding service VIPs.
#[async_trait]
pub trait NetlinkHandle: Send + Sync {
    /// Create the dummy device if missing. Returns true if it already existed.
    async fn ensure_dummy_device(&self, dev: &str) -> Result<bool>;

    /// Bind `address` to `dev`. Returns true if it was already bound.
    async fn ensure_address_bind(&self, address: &str, dev: &str) -> Result<bool>;

    async fn unbind_address(&self, address: &str, dev: &str) -> Result<()>;

    /// Addresses currently bound to `dev`.
    async fn list_bind_address(&self, dev: &str) -> Result<Vec<String>>;
}

/// Source of this node's interface addresses.
pub trait IpGetter: Send + Sync {
    /// Every address on the node's interfaces, excluding the dummy device.
    fn node_ips(&self) -> Result<Vec<IpAddr>>;
}

/// Reads interface addresses with `getifaddrs(3)`.
pub struct InterfaceIpGetter {
    dummy_device: String,
}

impl InterfaceIpGetter {
    pub fn new(dummy_device: impl Into<String>) -> Self {
        Self {
            dummy_device: dummy_device.into(),
        }
    }
}

impl IpGetter for InterfaceIpGetter {
    fn node_ips(&self) -> Result<Vec<IpAddr>> {
        let mut ips = BTreeSet::new();
        for ifa in nix::ifaddrs::getifaddrs()? {
            if ifa.interface_name == self.dummy_device {
                continue;
            }
            let Some(addr) = ifa.address else {
                continue;
            };
            if let Some(v4) = addr.as_sockaddr_in() {
                ips.insert(IpAddr::V4(v4.ip()));
            } else if let Some(v6) = addr.as_sockaddr_in6() {
                ips.insert(IpAddr::V6(v6.ip()));
            }
        }
        Ok(ips.into_iter().collect())
    }
}

/// Resolve node-port address CIDRs to concrete addresses.
///
/// No CIDRs means every address, spelled as the two zero CIDRs. Zero CIDRs
/// are kept as-is; other CIDRs expand to the node IPs they contain.
pub fn node_addresses(cidrs: &[String], getter: &dyn IpGetter) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    if cidrs.is_empty() {
        out.insert(pkg_constants::network::IPV4_ZERO_CIDR.to_string());
        out.insert(pkg_constants::network::IPV6_ZERO_CIDR.to_string());
        return Ok(out);
    }

    let mut nets = Vec::new();
    for cidr in cidrs {
        if is_zero_cidr(cidr) {
            out.insert(cidr.trim().to_string());
            continue;
        }
        let net: IpNetwork = cidr
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid node port address CIDR {:?}", cidr))?;
        nets.push(net);
    }
    if !nets.is_empty() {
        for ip in getter.node_ips()? {
            if nets.iter().any(|n| n.contains(ip)) {
                out.insert(ip.to_string());
            }
        }
    }
    if out.is_empty() {
        anyhow::bail!("no node addresses found for CIDRs {:?}", cidrs);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeIpGetter;

    #[test]
    fn empty_cidrs_mean_everything() {
        let getter = FakeIpGetter::new(&["192.168.1.10"]);
        let out = node_addresses(&[], &getter).unwrap();
        assert!(out.contains("0.0.0.0/0") && out.contains("::/0"));
    }

    #[test]
    fn cidrs_select_node_ips() {
        let getter = FakeIpGetter::new(&["192.168.1.10", "10.0.2.15", "fd00::10"]);
        let out = node_addresses(&["192.168.1.0/24".to_string()], &getter).unwrap();
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec!["192.168.1.10".to_string()]);

        assert!(node_addresses(&["172.16.0.0/12".to_string()], &getter).is_err());
        assert!(node_addresses(&["bogus".to_string()], &getter).is_err());
    }
}
