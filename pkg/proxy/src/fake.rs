//! In-memory dataplane backends.
//!
//! Used by the tests and by `k3rs-proxy --dry-run`, which computes the full
//! dataplane without touching the kernel. Every fake counts its calls by
//! method name.

use anyhow::Result;
use async_trait::async_trait;
use pkg_types::meta::{NamespacedName, Protocol};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::conntrack::Conntrack;
use crate::healthcheck::ServiceHealthServer;
use crate::ipset::{IpSet, IpSetBackend};
use crate::iptables::{Iptables, RulePosition, Table};
use crate::ipvs::{Ipvs, RealServer, VirtualServer};
use crate::lock;
use crate::netlink::{IpGetter, NetlinkHandle};
use crate::port::{Closeable, LocalPort, PortOpener};

#[derive(Default)]
struct CallCounter(Mutex<HashMap<&'static str, usize>>);

impl CallCounter {
    fn hit(&self, name: &'static str) {
        *lock(&self.0).entry(name).or_insert(0) += 1;
    }

    fn get(&self, name: &str) -> usize {
        lock(&self.0).get(name).copied().unwrap_or(0)
    }

    fn sum(&self, names: &[&str]) -> usize {
        names.iter().map(|n| self.get(n)).sum()
    }
}

// ─── IPVS ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeIpvs {
    services: Mutex<BTreeMap<String, (VirtualServer, Vec<RealServer>)>>,
    calls: CallCounter,
    fail_rs_listing: Mutex<bool>,
}

impl FakeIpvs {
    pub fn calls(&self, method: &str) -> usize {
        self.calls.get(method)
    }

    /// Calls that change the table.
    pub fn mutations(&self) -> usize {
        self.calls.sum(&[
            "add_virtual_server",
            "update_virtual_server",
            "delete_virtual_server",
            "add_real_server",
            "update_real_server",
            "delete_real_server",
        ])
    }

    pub fn set_connections(&self, vs: &VirtualServer, rs: &RealServer, active: u32) {
        if let Some((_, servers)) = lock(&self.services).get_mut(&vs.to_string()) {
            for s in servers.iter_mut().filter(|s| s.same_destination(rs)) {
                s.active_connections = active;
            }
        }
    }

    pub fn fail_real_server_listing(&self, fail: bool) {
        *lock(&self.fail_rs_listing) = fail;
    }

    pub fn virtual_server(&self, key: &str) -> Option<VirtualServer> {
        lock(&self.services).get(key).map(|(vs, _)| vs.clone())
    }

    /// Real servers of the virtual server printed as `key`, as `ip:port`.
    pub fn destinations(&self, key: &str) -> Vec<String> {
        lock(&self.services)
            .get(key)
            .map(|(_, rss)| rss.iter().map(|r| r.to_string()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Ipvs for FakeIpvs {
    async fn virtual_servers(&self) -> Result<Vec<VirtualServer>> {
        self.calls.hit("virtual_servers");
        Ok(lock(&self.services).values().map(|(vs, _)| vs.clone()).collect())
    }

    async fn add_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
        self.calls.hit("add_virtual_server");
        let mut services = lock(&self.services);
        if services.contains_key(&vs.to_string()) {
            anyhow::bail!("virtual server {} already exists", vs);
        }
        services.insert(vs.to_string(), (vs.clone(), Vec::new()));
        Ok(())
    }

    async fn update_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
        self.calls.hit("update_virtual_server");
        match lock(&self.services).get_mut(&vs.to_string()) {
            Some((existing, _)) => {
                *existing = vs.clone();
                Ok(())
            }
            None => anyhow::bail!("virtual server {} not found", vs),
        }
    }

    async fn delete_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
        self.calls.hit("delete_virtual_server");
        match lock(&self.services).remove(&vs.to_string()) {
            Some(_) => Ok(()),
            None => anyhow::bail!("virtual server {} not found", vs),
        }
    }

    async fn real_servers(&self, vs: &VirtualServer) -> Result<Vec<RealServer>> {
        self.calls.hit("real_servers");
        if *lock(&self.fail_rs_listing) {
            anyhow::bail!("listing real servers failed");
        }
        match lock(&self.services).get(&vs.to_string()) {
            Some((_, servers)) => Ok(servers.clone()),
            None => anyhow::bail!("virtual server {} not found", vs),
        }
    }

    async fn add_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        self.calls.hit("add_real_server");
        let mut services = lock(&self.services);
        let Some((_, servers)) = services.get_mut(&vs.to_string()) else {
            anyhow::bail!("virtual server {} not found", vs);
        };
        if servers.iter().any(|s| s.same_destination(rs)) {
            anyhow::bail!("real server {} already exists under {}", rs, vs);
        }
        servers.push(rs.clone());
        Ok(())
    }

    async fn update_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        self.calls.hit("update_real_server");
        let mut services = lock(&self.services);
        let Some((_, servers)) = services.get_mut(&vs.to_string()) else {
            anyhow::bail!("virtual server {} not found", vs);
        };
        match servers.iter_mut().find(|s| s.same_destination(rs)) {
            Some(s) => {
                s.weight = rs.weight;
                Ok(())
            }
            None => anyhow::bail!("real server {} not found under {}", rs, vs),
        }
    }

    async fn delete_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        self.calls.hit("delete_real_server");
        let mut services = lock(&self.services);
        let Some((_, servers)) = services.get_mut(&vs.to_string()) else {
            anyhow::bail!("virtual server {} not found", vs);
        };
        let before = servers.len();
        servers.retain(|s| !s.same_destination(rs));
        if servers.len() == before {
            anyhow::bail!("real server {} not found under {}", rs, vs);
        }
        Ok(())
    }
}

// ─── ipset ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeIpSet {
    sets: Mutex<BTreeMap<String, BTreeSet<String>>>,
    calls: CallCounter,
}

impl FakeIpSet {
    pub fn calls(&self, method: &str) -> usize {
        self.calls.get(method)
    }

    pub fn mutations(&self) -> usize {
        self.calls.sum(&["add_entry", "del_entry"])
    }

    pub fn entries(&self, set: &str) -> Vec<String> {
        lock(&self.sets)
            .get(set)
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl IpSetBackend for FakeIpSet {
    async fn ensure_set(&self, set: &IpSet) -> Result<()> {
        self.calls.hit("ensure_set");
        lock(&self.sets).entry(set.name.clone()).or_default();
        Ok(())
    }

    async fn list_entries(&self, set: &str) -> Result<Vec<String>> {
        self.calls.hit("list_entries");
        match lock(&self.sets).get(set) {
            Some(entries) => Ok(entries.iter().cloned().collect()),
            None => anyhow::bail!("ipset {} does not exist", set),
        }
    }

    async fn add_entry(&self, set: &str, entry: &str) -> Result<()> {
        self.calls.hit("add_entry");
        match lock(&self.sets).get_mut(set) {
            Some(entries) => {
                entries.insert(entry.to_string());
                Ok(())
            }
            None => anyhow::bail!("ipset {} does not exist", set),
        }
    }

    async fn del_entry(&self, set: &str, entry: &str) -> Result<()> {
        self.calls.hit("del_entry");
        let removed = lock(&self.sets)
            .get_mut(set)
            .is_some_and(|entries| entries.remove(entry));
        if !removed {
            anyhow::bail!("{} is not in ipset {}", entry, set);
        }
        Ok(())
    }
}

// ─── iptables ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeIptables {
    chains: Mutex<BTreeSet<(Table, String)>>,
    rules: Mutex<Vec<(Table, String, Vec<String>)>>,
    last_restore: Mutex<Option<Vec<u8>>>,
    fail_restore: Mutex<bool>,
    calls: CallCounter,
}

impl FakeIptables {
    pub fn calls(&self, method: &str) -> usize {
        self.calls.get(method)
    }

    pub fn fail_restore(&self, fail: bool) {
        *lock(&self.fail_restore) = fail;
    }

    /// Payload of the last successful restore.
    pub fn last_restore(&self) -> Option<String> {
        lock(&self.last_restore)
            .as_ref()
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }
}

#[async_trait]
impl Iptables for FakeIptables {
    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<bool> {
        self.calls.hit("ensure_chain");
        Ok(!lock(&self.chains).insert((table, chain.to_string())))
    }

    async fn ensure_rule(
        &self,
        _position: RulePosition,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> Result<bool> {
        self.calls.hit("ensure_rule");
        let mut rules = lock(&self.rules);
        let exists = rules
            .iter()
            .any(|(t, c, a)| *t == table && c == chain && a.as_slice() == args);
        if !exists {
            rules.push((table, chain.to_string(), args.to_vec()));
        }
        Ok(exists)
    }

    async fn restore_all(&self, data: &[u8]) -> Result<()> {
        self.calls.hit("restore_all");
        if *lock(&self.fail_restore) {
            anyhow::bail!("iptables-restore: line 1 failed");
        }
        *lock(&self.last_restore) = Some(data.to_vec());
        Ok(())
    }
}

// ─── netlink ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeNetlink {
    devices: Mutex<BTreeMap<String, BTreeSet<String>>>,
    fail_device: Mutex<bool>,
    calls: CallCounter,
}

impl FakeNetlink {
    pub fn calls(&self, method: &str) -> usize {
        self.calls.get(method)
    }

    pub fn mutations(&self) -> usize {
        self.calls.sum(&["ensure_address_bind_new", "unbind_address"])
    }

    pub fn fail_device(&self, fail: bool) {
        *lock(&self.fail_device) = fail;
    }

    pub fn bound(&self, dev: &str) -> Vec<String> {
        lock(&self.devices)
            .get(dev)
            .map(|a| a.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NetlinkHandle for FakeNetlink {
    async fn ensure_dummy_device(&self, dev: &str) -> Result<bool> {
        self.calls.hit("ensure_dummy_device");
        if *lock(&self.fail_device) {
            anyhow::bail!("failed to create device {}", dev);
        }
        let mut devices = lock(&self.devices);
        let exists = devices.contains_key(dev);
        devices.entry(dev.to_string()).or_default();
        Ok(exists)
    }

    async fn ensure_address_bind(&self, address: &str, dev: &str) -> Result<bool> {
        self.calls.hit("ensure_address_bind");
        let mut devices = lock(&self.devices);
        let Some(addrs) = devices.get_mut(dev) else {
            anyhow::bail!("device {} does not exist", dev);
        };
        let added = addrs.insert(address.to_string());
        if added {
            self.calls.hit("ensure_address_bind_new");
        }
        Ok(!added)
    }

    async fn unbind_address(&self, address: &str, dev: &str) -> Result<()> {
        self.calls.hit("unbind_address");
        let removed = lock(&self.devices)
            .get_mut(dev)
            .is_some_and(|addrs| addrs.remove(address));
        if !removed {
            anyhow::bail!("{} is not bound to {}", address, dev);
        }
        Ok(())
    }

    async fn list_bind_address(&self, dev: &str) -> Result<Vec<String>> {
        self.calls.hit("list_bind_address");
        Ok(self.bound(dev))
    }
}

// ─── local ports ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakePortOpener {
    opened: Arc<Mutex<Vec<LocalPort>>>,
    closed: Arc<Mutex<Vec<LocalPort>>>,
}

impl FakePortOpener {
    pub fn opened(&self) -> Vec<LocalPort> {
        lock(&self.opened).clone()
    }

    pub fn closed(&self) -> Vec<LocalPort> {
        lock(&self.closed).clone()
    }
}

struct FakeSocket {
    port: LocalPort,
    closed: Arc<Mutex<Vec<LocalPort>>>,
}

impl Closeable for FakeSocket {
    fn close(&mut self) -> Result<()> {
        lock(&self.closed).push(self.port.clone());
        Ok(())
    }
}

impl PortOpener for FakePortOpener {
    fn open_local_port(&self, lp: &LocalPort) -> Result<Box<dyn Closeable>> {
        lock(&self.opened).push(lp.clone());
        Ok(Box::new(FakeSocket {
            port: lp.clone(),
            closed: self.closed.clone(),
        }))
    }
}

// ─── conntrack ───────────────────────────────────────────────────────────

/// Records every cleanup as a readable line.
#[derive(Default)]
pub struct FakeConntrack {
    cleared: Mutex<Vec<String>>,
}

impl FakeConntrack {
    pub fn cleared(&self) -> Vec<String> {
        lock(&self.cleared).clone()
    }
}

#[async_trait]
impl Conntrack for FakeConntrack {
    async fn clear_entries_for_ip(&self, ip: &str, protocol: Protocol) -> Result<()> {
        lock(&self.cleared).push(format!("ip {} {}", ip, protocol.lowercase()));
        Ok(())
    }

    async fn clear_entries_for_nat(
        &self,
        origin: &str,
        dest: &str,
        protocol: Protocol,
    ) -> Result<()> {
        lock(&self.cleared).push(format!("nat {} -> {} {}", origin, dest, protocol.lowercase()));
        Ok(())
    }

    async fn clear_entries_for_port(
        &self,
        port: u16,
        _is_ipv6: bool,
        protocol: Protocol,
    ) -> Result<()> {
        lock(&self.cleared).push(format!("port {} {}", port, protocol.lowercase()));
        Ok(())
    }
}

// ─── node addresses ──────────────────────────────────────────────────────

pub struct FakeIpGetter {
    ips: Vec<IpAddr>,
}

impl FakeIpGetter {
    pub fn new(ips: &[&str]) -> Self {
        Self {
            ips: ips.iter().filter_map(|ip| ip.parse().ok()).collect(),
        }
    }
}

impl IpGetter for FakeIpGetter {
    fn node_ips(&self) -> Result<Vec<IpAddr>> {
        Ok(self.ips.clone())
    }
}

// ─── service health ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeHealthServer {
    services: Mutex<HashMap<NamespacedName, u16>>,
    endpoints: Mutex<HashMap<NamespacedName, usize>>,
}

impl FakeHealthServer {
    pub fn services(&self) -> HashMap<NamespacedName, u16> {
        lock(&self.services).clone()
    }

    pub fn endpoints(&self) -> HashMap<NamespacedName, usize> {
        lock(&self.endpoints).clone()
    }
}

#[async_trait]
impl ServiceHealthServer for FakeHealthServer {
    async fn sync_services(&self, services: HashMap<NamespacedName, u16>) -> Result<()> {
        *lock(&self.services) = services;
        Ok(())
    }

    /// Known services missing from `endpoints` count zero.
    async fn sync_endpoints(&self, endpoints: HashMap<NamespacedName, usize>) -> Result<()> {
        let services = lock(&self.services);
        *lock(&self.endpoints) = services
            .keys()
            .map(|name| (name.clone(), endpoints.get(name).copied().unwrap_or(0)))
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipset::SetType;
    use pkg_types::meta::IpFamily;

    #[tokio::test]
    async fn ipset_entries_are_removed_once() {
        let ipset = FakeIpSet::default();
        let set = IpSet {
            name: "KUBE-CLUSTER-IP".to_string(),
            set_type: SetType::HashIpPort,
            family: IpFamily::IPv4,
            comment: String::new(),
        };
        ipset.ensure_set(&set).await.unwrap();
        ipset.add_entry("KUBE-CLUSTER-IP", "10.0.0.5,tcp:80").await.unwrap();

        ipset.del_entry("KUBE-CLUSTER-IP", "10.0.0.5,tcp:80").await.unwrap();
        assert!(ipset.entries("KUBE-CLUSTER-IP").is_empty());
        assert!(ipset.del_entry("KUBE-CLUSTER-IP", "10.0.0.5,tcp:80").await.is_err());
        assert!(ipset.del_entry("KUBE-MISSING", "10.0.0.5,tcp:80").await.is_err());
    }

    #[tokio::test]
    async fn addresses_are_unbound_once() {
        let netlink = FakeNetlink::default();
        netlink.ensure_dummy_device("kube-ipvs0").await.unwrap();
        netlink.ensure_address_bind("10.0.0.5", "kube-ipvs0").await.unwrap();

        netlink.unbind_address("10.0.0.5", "kube-ipvs0").await.unwrap();
        assert!(netlink.bound("kube-ipvs0").is_empty());
        assert!(netlink.unbind_address("10.0.0.5", "kube-ipvs0").await.is_err());
        assert!(netlink.unbind_address("10.0.0.5", "dummy9").await.is_err());
    }
}
