use anyhow::Result;
use async_trait::async_trait;
use pkg_constants::dataplane as dp;
use std::collections::BTreeMap;

use crate::config::ProxierConfig;
use crate::ipset::{ProxyIpSet, SetType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Nat,
    Filter,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePosition {
    Prepend,
    Append,
}

impl RulePosition {
    pub fn flag(&self) -> &'static str {
        match self {
            RulePosition::Prepend => "-I",
            RulePosition::Append => "-A",
        }
    }
}

/// iptables access.
#[async_trait]
pub trait Iptables: Send + Sync {
    /// Create a chain if missing. Returns true if it already existed.
    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<bool>;

    /// Insert a rule if missing. Returns true if it already existed.
    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> Result<bool>;

    /// Atomically load a full `iptables-restore` payload without flushing
    /// chains it doesn't mention.
    async fn restore_all(&self, data: &[u8]) -> Result<()>;
}

/// Built-in chains jumping into the proxy's chains.
pub const JUMP_CHAINS: &[(Table, &str, &str, &str)] = &[
    (Table::Nat, "OUTPUT", dp::SERVICES_CHAIN, "k3rs service portals"),
    (Table::Nat, "PREROUTING", dp::SERVICES_CHAIN, "k3rs service portals"),
    (Table::Nat, "POSTROUTING", dp::POSTROUTING_CHAIN, "k3rs postrouting rules"),
    (Table::Filter, "FORWARD", dp::FORWARD_CHAIN, "k3rs forwarding rules"),
    (Table::Filter, "INPUT", dp::NODE_PORT_CHAIN, "k3rs health check rules"),
];

/// Chains rewritten on every restore.
pub const CHAINS: &[(Table, &str)] = &[
    (Table::Nat, dp::SERVICES_CHAIN),
    (Table::Nat, dp::POSTROUTING_CHAIN),
    (Table::Nat, dp::FIREWALL_CHAIN),
    (Table::Nat, dp::NODE_PORT_CHAIN),
    (Table::Nat, dp::LOAD_BALANCER_CHAIN),
    (Table::Nat, dp::MARK_MASQ_CHAIN),
    (Table::Filter, dp::FORWARD_CHAIN),
    (Table::Filter, dp::NODE_PORT_CHAIN),
];

/// Chains that must exist but whose rules are owned elsewhere.
pub const ENSURE_CHAINS: &[(Table, &str)] = &[(Table::Nat, dp::MARK_DROP_CHAIN)];

/// ipsets matched from a chain: (set, from chain, target, match type, protocol).
const SET_CHAIN_RULES: &[(&str, &str, &str, &str, &str)] = &[
    (dp::LOOP_BACK_IP_SET, dp::POSTROUTING_CHAIN, "MASQUERADE", "dst,dst,src", ""),
    (dp::LOAD_BALANCER_SET, dp::SERVICES_CHAIN, dp::LOAD_BALANCER_CHAIN, "dst,dst", ""),
    (dp::LOAD_BALANCER_FW_SET, dp::LOAD_BALANCER_CHAIN, dp::FIREWALL_CHAIN, "dst,dst", ""),
    (dp::LOAD_BALANCER_SOURCE_CIDR_SET, dp::FIREWALL_CHAIN, "RETURN", "dst,dst,src", ""),
    (dp::LOAD_BALANCER_SOURCE_IP_SET, dp::FIREWALL_CHAIN, "RETURN", "dst,dst,src", ""),
    (dp::LOAD_BALANCER_LOCAL_SET, dp::LOAD_BALANCER_CHAIN, "RETURN", "dst,dst", ""),
    (dp::NODE_PORT_LOCAL_TCP_SET, dp::NODE_PORT_CHAIN, "RETURN", "dst", "tcp"),
    (dp::NODE_PORT_TCP_SET, dp::NODE_PORT_CHAIN, dp::MARK_MASQ_CHAIN, "dst", "tcp"),
    (dp::NODE_PORT_LOCAL_UDP_SET, dp::NODE_PORT_CHAIN, "RETURN", "dst", "udp"),
    (dp::NODE_PORT_UDP_SET, dp::NODE_PORT_CHAIN, dp::MARK_MASQ_CHAIN, "dst", "udp"),
    (dp::NODE_PORT_SCTP_SET, dp::NODE_PORT_CHAIN, dp::MARK_MASQ_CHAIN, "dst,dst", "sctp"),
    (dp::NODE_PORT_LOCAL_SCTP_SET, dp::NODE_PORT_CHAIN, "RETURN", "dst,dst", "sctp"),
];

fn line(buf: &mut String, args: &[&str]) {
    buf.push_str(&args.join(" "));
    buf.push('\n');
}

fn quoted(s: &str) -> String {
    format!("\"{}\"", s)
}

/// Accept external-IP traffic from off-node, and traffic to IPs that are local.
fn external_ip_rules(nat: &mut String, base: &[&str]) {
    let mut off_node = base.to_vec();
    off_node.extend([
        "-m",
        "physdev",
        "!",
        "--physdev-is-in",
        "-m",
        "addrtype",
        "!",
        "--src-type",
        "LOCAL",
        "-j",
        "ACCEPT",
    ]);
    line(nat, &off_node);
    let mut dst_local = base.to_vec();
    dst_local.extend(["-m", "addrtype", "--dst-type", "LOCAL", "-j", "ACCEPT"]);
    line(nat, &dst_local);
}

/// Build the `iptables-restore` payload for the current ipset contents.
///
/// Rules only reference sets, so the payload changes when a set goes from
/// empty to non-empty (or back), not on every membership change.
pub fn write_iptables_rules(sets: &BTreeMap<&'static str, ProxyIpSet>, cfg: &ProxierConfig) -> String {
    let mut nat_chains = String::from("*nat\n");
    let mut filter_chains = String::from("*filter\n");
    for (table, chain) in CHAINS {
        let buf = match table {
            Table::Nat => &mut nat_chains,
            Table::Filter => &mut filter_chains,
        };
        buf.push_str(&format!(":{} - [0:0]\n", chain));
    }

    let mut nat = String::new();
    let mut filter = String::new();
    let non_empty = |name: &str| sets.get(name).filter(|s| !s.is_empty());
    let mark = cfg.masquerade_mark();
    let mark_match = format!("{}/{}", mark, mark);

    for &(set_name, from, to, match_type, proto) in SET_CHAIN_RULES {
        let Some(set) = non_empty(set_name) else {
            continue;
        };
        let comment = quoted(&set.set.comment);
        let mut args = vec!["-A", from];
        if !proto.is_empty() {
            args.extend(["-p", proto]);
        }
        args.extend(["-m", "comment", "--comment", comment.as_str()]);
        args.extend(["-m", "set", "--match-set", set_name, match_type, "-j", to]);
        line(&mut nat, &args);
    }

    if let Some(set) = non_empty(dp::CLUSTER_IP_SET) {
        let comment = quoted(&set.set.comment);
        let base = [
            "-A",
            dp::SERVICES_CHAIN,
            "-m",
            "comment",
            "--comment",
            comment.as_str(),
            "-m",
            "set",
            "--match-set",
            dp::CLUSTER_IP_SET,
        ];
        let cidr = cfg.cluster_cidr.map(|c| c.to_string());
        let mut args: Vec<&str> = base.to_vec();
        if cfg.masquerade_all {
            args.extend(["dst,dst", "-j", dp::MARK_MASQ_CHAIN]);
        } else if let Some(cidr) = cidr.as_deref() {
            // Off-cluster sources reaching a VIP may bounce to another node.
            args.extend(["dst,dst", "!", "-s", cidr, "-j", dp::MARK_MASQ_CHAIN]);
        } else {
            // Node-originated traffic picks the VIP as source on the dummy device.
            args.extend(["src,dst", "-j", dp::MARK_MASQ_CHAIN]);
        }
        line(&mut nat, &args);
    }

    if let Some(set) = non_empty(dp::EXTERNAL_IP_SET) {
        let comment = quoted(&set.set.comment);
        let base = [
            "-A",
            dp::SERVICES_CHAIN,
            "-m",
            "comment",
            "--comment",
            comment.as_str(),
            "-m",
            "set",
            "--match-set",
            dp::EXTERNAL_IP_SET,
            "dst,dst",
        ];
        let mut masq = base.to_vec();
        masq.extend(["-j", dp::MARK_MASQ_CHAIN]);
        line(&mut nat, &masq);
        external_ip_rules(&mut nat, &base);
    }

    if let Some(set) = non_empty(dp::EXTERNAL_IP_LOCAL_SET) {
        let comment = quoted(&set.set.comment);
        let base = [
            "-A",
            dp::SERVICES_CHAIN,
            "-m",
            "comment",
            "--comment",
            comment.as_str(),
            "-m",
            "set",
            "--match-set",
            dp::EXTERNAL_IP_LOCAL_SET,
            "dst,dst",
        ];
        external_ip_rules(&mut nat, &base);
    }

    line(
        &mut nat,
        &["-A", dp::SERVICES_CHAIN, "-m", "addrtype", "--dst-type", "LOCAL", "-j", dp::NODE_PORT_CHAIN],
    );
    line(&mut nat, &["-A", dp::LOAD_BALANCER_CHAIN, "-j", dp::MARK_MASQ_CHAIN]);
    line(&mut nat, &["-A", dp::FIREWALL_CHAIN, "-j", dp::MARK_DROP_CHAIN]);

    // Accept VIP traffic last so later rules elsewhere cannot drop it.
    for set_name in [dp::CLUSTER_IP_SET, dp::LOAD_BALANCER_SET] {
        if let Some(set) = non_empty(set_name) {
            let match_type = match set.set.set_type {
                SetType::BitmapPort => "dst",
                _ => "dst,dst",
            };
            line(
                &mut nat,
                &["-A", dp::SERVICES_CHAIN, "-m", "set", "--match-set", set_name, match_type, "-j", "ACCEPT"],
            );
        }
    }

    let fwd_comment = quoted("k3rs forwarding rules");
    line(
        &mut filter,
        &["-A", dp::FORWARD_CHAIN, "-m", "comment", "--comment", fwd_comment.as_str(), "-m", "mark", "--mark", mark_match.as_str(), "-j", "ACCEPT"],
    );
    for comment in ["k3rs forwarding conntrack pod source rule", "k3rs forwarding conntrack pod destination rule"] {
        let comment = quoted(comment);
        line(
            &mut filter,
            &["-A", dp::FORWARD_CHAIN, "-m", "comment", "--comment", comment.as_str(), "-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j", "ACCEPT"],
        );
    }
    if let Some(set) = sets.get(dp::HEALTH_CHECK_NODE_PORT_SET) {
        let comment = quoted(&set.set.comment);
        line(
            &mut filter,
            &["-A", dp::NODE_PORT_CHAIN, "-m", "comment", "--comment", comment.as_str(), "-m", "set", "--match-set", dp::HEALTH_CHECK_NODE_PORT_SET, "dst", "-j", "ACCEPT"],
        );
    }

    line(
        &mut nat,
        &["-A", dp::POSTROUTING_CHAIN, "-m", "mark", "!", "--mark", mark_match.as_str(), "-j", "RETURN"],
    );
    line(&mut nat, &["-A", dp::POSTROUTING_CHAIN, "-j", "MARK", "--xor-mark", mark.as_str()]);
    let snat_comment = quoted("k3rs service traffic requiring SNAT");
    line(
        &mut nat,
        &["-A", dp::POSTROUTING_CHAIN, "-m", "comment", "--comment", snat_comment.as_str(), "-j", "MASQUERADE"],
    );
    line(&mut nat, &["-A", dp::MARK_MASQ_CHAIN, "-j", "MARK", "--or-mark", mark.as_str()]);

    nat.push_str("COMMIT\n");
    filter.push_str("COMMIT\n");

    let mut out = nat_chains;
    out.push_str(&nat);
    out.push_str(&filter_chains);
    out.push_str(&filter);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipset::{Entry, proxy_ipsets};
    use pkg_types::meta::IpFamily;

    #[test]
    fn empty_sets_produce_base_rules() {
        let sets = proxy_ipsets(IpFamily::IPv4);
        let out = write_iptables_rules(&sets, &ProxierConfig::default());
        assert!(out.starts_with("*nat\n:K3RS-SERVICES - [0:0]\n"));
        assert!(out.contains("-A K3RS-SERVICES -m addrtype --dst-type LOCAL -j K3RS-NODE-PORT\n"));
        assert!(out.contains("-A K3RS-MARK-MASQ -j MARK --or-mark 0x00004000\n"));
        assert!(!out.contains("--match-set K3RS-CLUSTER-IP"));
        assert_eq!(out.matches("COMMIT\n").count(), 2);
        assert!(out.contains("*filter\n:K3RS-FORWARD - [0:0]\n"));
    }

    #[test]
    fn cluster_ip_masquerade_modes() {
        let mut sets = proxy_ipsets(IpFamily::IPv4);
        sets.get_mut(dp::CLUSTER_IP_SET)
            .unwrap()
            .insert(&Entry::ip_port("10.0.0.5", 80, "tcp"));

        let out = write_iptables_rules(&sets, &ProxierConfig::default());
        assert!(out.contains("--match-set K3RS-CLUSTER-IP src,dst -j K3RS-MARK-MASQ"));
        assert!(out.contains("-A K3RS-SERVICES -m set --match-set K3RS-CLUSTER-IP dst,dst -j ACCEPT"));

        let cfg = ProxierConfig {
            cluster_cidr: Some("10.42.0.0/16".parse().unwrap()),
            ..Default::default()
        };
        let out = write_iptables_rules(&sets, &cfg);
        assert!(out.contains("--match-set K3RS-CLUSTER-IP dst,dst ! -s 10.42.0.0/16 -j K3RS-MARK-MASQ"));

        let cfg = ProxierConfig {
            masquerade_all: true,
            ..Default::default()
        };
        let out = write_iptables_rules(&sets, &cfg);
        assert!(out.contains("--match-set K3RS-CLUSTER-IP dst,dst -j K3RS-MARK-MASQ"));
    }

    #[test]
    fn node_port_sets_add_protocol_match() {
        let mut sets = proxy_ipsets(IpFamily::IPv4);
        sets.get_mut(dp::NODE_PORT_TCP_SET)
            .unwrap()
            .insert(&Entry::port(30080, "tcp"));
        let out = write_iptables_rules(&sets, &ProxierConfig::default());
        assert!(out.contains("-A K3RS-NODE-PORT -p tcp -m comment"));
        assert!(out.contains("--match-set K3RS-NODE-PORT-TCP dst -j K3RS-MARK-MASQ"));
    }

    #[test]
    fn payload_is_deterministic() {
        let sets = proxy_ipsets(IpFamily::IPv4);
        let cfg = ProxierConfig::default();
        assert_eq!(write_iptables_rules(&sets, &cfg), write_iptables_rules(&sets, &cfg));
    }
}
