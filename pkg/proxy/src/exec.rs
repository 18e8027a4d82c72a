//! Dataplane backends driving the standard Linux CLIs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use pkg_constants::paths;
use pkg_types::meta::{IpFamily, Protocol};
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::conntrack::Conntrack;
use crate::ipset::{IpSet, IpSetBackend};
use crate::iptables::{Iptables, RulePosition, Table};
use crate::ipvs::{FLAG_PERSISTENT, Ipvs, RealServer, VirtualServer};
use crate::netlink::NetlinkHandle;

/// Output of a finished command.
struct Output {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn exec(bin: &str, args: &[String], stdin: Option<&[u8]>) -> Result<Output> {
    debug!("running {} {}", bin, args.join(" "));
    let mut cmd = Command::new(bin);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    }
    let mut child = cmd.spawn().with_context(|| format!("failed to run {}", bin))?;
    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(data)
            .await
            .with_context(|| format!("failed to write stdin of {}", bin))?;
    }
    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for {}", bin))?;
    Ok(Output {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Run a command, failing with its stderr if it exits non-zero.
async fn run(bin: &str, args: &[String]) -> Result<String> {
    let out = exec(bin, args, None).await?;
    if out.success {
        Ok(out.stdout)
    } else {
        anyhow::bail!("{} {} failed: {}", bin, args.join(" "), out.stderr.trim())
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ─── ipvsadm ─────────────────────────────────────────────────────────────

/// [`Ipvs`] over `ipvsadm`, using NAT forwarding for every real server.
#[derive(Default)]
pub struct ExecIpvs;

fn service_flag(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "-t",
        Protocol::Udp => "-u",
        Protocol::Sctp => "--sctp-service",
    }
}

fn format_addr(ip: IpAddr, port: u16) -> String {
    SocketAddr::new(ip, port).to_string()
}

fn service_args(op: &str, vs: &VirtualServer) -> Vec<String> {
    vec![
        op.to_string(),
        service_flag(vs.protocol).to_string(),
        format_addr(vs.address, vs.port),
    ]
}

fn virtual_server_args(op: &str, vs: &VirtualServer) -> Vec<String> {
    let mut out = service_args(op, vs);
    out.push("-s".into());
    out.push(vs.scheduler.clone());
    if vs.is_persistent() {
        out.push("-p".into());
        out.push(vs.timeout.to_string());
    }
    out
}

fn real_server_args(op: &str, vs: &VirtualServer, rs: &RealServer, weight: bool) -> Vec<String> {
    let mut out = service_args(op, vs);
    out.push("-r".into());
    out.push(format_addr(rs.address, rs.port));
    if weight {
        out.push("-m".into());
        out.push("-w".into());
        out.push(rs.weight.to_string());
    }
    out
}

/// Parse `ipvsadm -Ln` output into virtual servers and their destinations.
pub fn parse_ipvsadm_list(output: &str) -> Result<Vec<(VirtualServer, Vec<RealServer>)>> {
    let mut out: Vec<(VirtualServer, Vec<RealServer>)> = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = fields.first() else {
            continue;
        };
        if *first == "->" {
            // Header row of the destination table.
            if fields.get(1) == Some(&"RemoteAddress:Port") {
                continue;
            }
            let Some((_, servers)) = out.last_mut() else {
                anyhow::bail!("real server listed before any virtual server: {:?}", line);
            };
            if fields.len() < 6 {
                anyhow::bail!("malformed real server line: {:?}", line);
            }
            let addr: SocketAddr = fields[1]
                .parse()
                .with_context(|| format!("bad real server address in {:?}", line))?;
            let mut rs = RealServer::new(addr.ip(), addr.port(), fields[3].parse()?);
            rs.active_connections = fields[4].parse()?;
            rs.inactive_connections = fields[5].parse()?;
            servers.push(rs);
            continue;
        }
        let protocol = match *first {
            "TCP" => Protocol::Tcp,
            "UDP" => Protocol::Udp,
            "SCTP" => Protocol::Sctp,
            _ => continue,
        };
        if fields.len() < 3 {
            anyhow::bail!("malformed virtual server line: {:?}", line);
        }
        let addr: SocketAddr = fields[1]
            .parse()
            .with_context(|| format!("bad virtual server address in {:?}", line))?;
        let mut vs = VirtualServer::new(addr.ip(), addr.port(), protocol, fields[2]);
        if let Some(pos) = fields.iter().position(|f| *f == "persistent") {
            vs.flags |= FLAG_PERSISTENT;
            vs.timeout = fields
                .get(pos + 1)
                .and_then(|t| t.parse().ok())
                .unwrap_or_default();
        }
        out.push((vs, Vec::new()));
    }
    Ok(out)
}

#[async_trait]
impl Ipvs for ExecIpvs {
    async fn virtual_servers(&self) -> Result<Vec<VirtualServer>> {
        let out = run(paths::IPVSADM_BIN, &args(&["-Ln"])).await?;
        Ok(parse_ipvsadm_list(&out)?
            .into_iter()
            .map(|(vs, _)| vs)
            .collect())
    }

    async fn add_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
        run(paths::IPVSADM_BIN, &virtual_server_args("-A", vs)).await?;
        Ok(())
    }

    async fn update_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
        run(paths::IPVSADM_BIN, &virtual_server_args("-E", vs)).await?;
        Ok(())
    }

    async fn delete_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
        run(paths::IPVSADM_BIN, &service_args("-D", vs)).await?;
        Ok(())
    }

    async fn real_servers(&self, vs: &VirtualServer) -> Result<Vec<RealServer>> {
        let mut list = args(&["-Ln"]);
        list.extend(service_args("", vs).into_iter().skip(1));
        let out = run(paths::IPVSADM_BIN, &list).await?;
        Ok(parse_ipvsadm_list(&out)?
            .into_iter()
            .next()
            .map(|(_, rss)| rss)
            .unwrap_or_default())
    }

    async fn add_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        run(paths::IPVSADM_BIN, &real_server_args("-a", vs, rs, true)).await?;
        Ok(())
    }

    async fn update_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        run(paths::IPVSADM_BIN, &real_server_args("-e", vs, rs, true)).await?;
        Ok(())
    }

    async fn delete_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        run(paths::IPVSADM_BIN, &real_server_args("-d", vs, rs, false)).await?;
        Ok(())
    }
}

// ─── ipset ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ExecIpSet;

/// Members of an `ipset list` output.
pub fn parse_ipset_members(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|l| !l.starts_with("Members:"))
        .skip(1)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        // Members may carry a trailing `comment "..."`.
        .filter_map(|l| l.split_whitespace().next())
        .map(String::from)
        .collect()
}

#[async_trait]
impl IpSetBackend for ExecIpSet {
    async fn ensure_set(&self, set: &IpSet) -> Result<()> {
        let mut list = args(&["create", &set.name]);
        list.extend(set.create_args());
        list.push("-exist".into());
        run(paths::IPSET_BIN, &list).await?;
        Ok(())
    }

    async fn list_entries(&self, set: &str) -> Result<Vec<String>> {
        let out = run(paths::IPSET_BIN, &args(&["list", set])).await?;
        Ok(parse_ipset_members(&out))
    }

    async fn add_entry(&self, set: &str, entry: &str) -> Result<()> {
        run(paths::IPSET_BIN, &args(&["add", set, entry, "-exist"])).await?;
        Ok(())
    }

    async fn del_entry(&self, set: &str, entry: &str) -> Result<()> {
        run(paths::IPSET_BIN, &args(&["del", set, entry, "-exist"])).await?;
        Ok(())
    }
}

// ─── iptables ────────────────────────────────────────────────────────────

pub struct ExecIptables {
    family: IpFamily,
}

impl ExecIptables {
    pub fn new(family: IpFamily) -> Self {
        Self { family }
    }

    fn bin(&self) -> &'static str {
        match self.family {
            IpFamily::IPv4 => paths::IPTABLES_BIN,
            IpFamily::IPv6 => paths::IP6TABLES_BIN,
        }
    }

    fn restore_bin(&self) -> &'static str {
        match self.family {
            IpFamily::IPv4 => paths::IPTABLES_RESTORE_BIN,
            IpFamily::IPv6 => paths::IP6TABLES_RESTORE_BIN,
        }
    }
}

#[async_trait]
impl Iptables for ExecIptables {
    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<bool> {
        let out = exec(self.bin(), &args(&["-w", "-t", table.as_str(), "-N", chain]), None).await?;
        if out.success {
            return Ok(false);
        }
        if out.stderr.contains("already exists") {
            return Ok(true);
        }
        anyhow::bail!("failed to create chain {}/{}: {}", table.as_str(), chain, out.stderr.trim())
    }

    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: &str,
        rule: &[String],
    ) -> Result<bool> {
        let mut check = args(&["-w", "-t", table.as_str(), "-C", chain]);
        check.extend_from_slice(rule);
        if exec(self.bin(), &check, None).await?.success {
            return Ok(true);
        }
        let mut add = args(&["-w", "-t", table.as_str(), position.flag(), chain]);
        add.extend_from_slice(rule);
        run(self.bin(), &add).await?;
        Ok(false)
    }

    async fn restore_all(&self, data: &[u8]) -> Result<()> {
        let out = exec(
            self.restore_bin(),
            &args(&["-w", "--noflush", "--counters"]),
            Some(data),
        )
        .await?;
        if !out.success {
            anyhow::bail!("{} failed: {}", self.restore_bin(), out.stderr.trim());
        }
        Ok(())
    }
}

// ─── ip ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ExecNetlink;

fn host_prefix(address: &str) -> Result<String> {
    let ip: IpAddr = address
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid address {:?}", address))?;
    Ok(match ip {
        IpAddr::V4(_) => format!("{}/32", ip),
        IpAddr::V6(_) => format!("{}/128", ip),
    })
}

/// Addresses in `ip -o addr show` output, without prefix length.
pub fn parse_ip_addr_show(output: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        for pair in fields.windows(2) {
            if pair[0] == "inet" || pair[0] == "inet6" {
                let addr = pair[1].split('/').next().unwrap_or(pair[1]);
                out.push(addr.to_string());
            }
        }
    }
    out
}

#[async_trait]
impl NetlinkHandle for ExecNetlink {
    async fn ensure_dummy_device(&self, dev: &str) -> Result<bool> {
        if exec(paths::IP_BIN, &args(&["link", "show", "dev", dev]), None).await?.success {
            return Ok(true);
        }
        run(paths::IP_BIN, &args(&["link", "add", dev, "type", "dummy"])).await?;
        Ok(false)
    }

    async fn ensure_address_bind(&self, address: &str, dev: &str) -> Result<bool> {
        let prefix = host_prefix(address)?;
        let out = exec(paths::IP_BIN, &args(&["addr", "add", &prefix, "dev", dev]), None).await?;
        if out.success {
            return Ok(false);
        }
        if out.stderr.contains("File exists") {
            return Ok(true);
        }
        anyhow::bail!("failed to bind {} to {}: {}", address, dev, out.stderr.trim())
    }

    async fn unbind_address(&self, address: &str, dev: &str) -> Result<()> {
        let prefix = host_prefix(address)?;
        run(paths::IP_BIN, &args(&["addr", "del", &prefix, "dev", dev])).await?;
        Ok(())
    }

    async fn list_bind_address(&self, dev: &str) -> Result<Vec<String>> {
        let out = run(paths::IP_BIN, &args(&["-o", "addr", "show", "dev", dev])).await?;
        Ok(parse_ip_addr_show(&out))
    }
}

// ─── conntrack ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ExecConntrack;

/// Printed (with a failing exit code) when a filter matched nothing.
const NO_CONNECTION_TO_DELETE: &str = "0 flow entries have been deleted";

fn family_args(is_ipv6: bool) -> Vec<String> {
    if is_ipv6 {
        args(&["-f", "ipv6"])
    } else {
        Vec::new()
    }
}

fn is_ipv6(ip: &str) -> bool {
    ip.parse::<IpAddr>().is_ok_and(|ip| ip.is_ipv6())
}

async fn delete_flows(mut filter: Vec<String>) -> Result<()> {
    filter.insert(0, "-D".into());
    let out = exec(paths::CONNTRACK_BIN, &filter, None).await?;
    if out.success || out.stderr.contains(NO_CONNECTION_TO_DELETE) {
        return Ok(());
    }
    anyhow::bail!("conntrack {} failed: {}", filter.join(" "), out.stderr.trim())
}

#[async_trait]
impl Conntrack for ExecConntrack {
    async fn clear_entries_for_ip(&self, ip: &str, protocol: Protocol) -> Result<()> {
        let mut filter = args(&["--orig-dst", ip, "-p", protocol.lowercase()]);
        filter.extend(family_args(is_ipv6(ip)));
        delete_flows(filter).await
    }

    async fn clear_entries_for_nat(
        &self,
        origin: &str,
        dest: &str,
        protocol: Protocol,
    ) -> Result<()> {
        let mut filter = args(&["--orig-dst", origin, "--dst-nat", dest, "-p", protocol.lowercase()]);
        filter.extend(family_args(is_ipv6(origin)));
        delete_flows(filter).await
    }

    async fn clear_entries_for_port(
        &self,
        port: u16,
        is_ipv6: bool,
        protocol: Protocol,
    ) -> Result<()> {
        let port = port.to_string();
        let mut filter = args(&["-p", protocol.lowercase(), "--dport", &port]);
        filter.extend(family_args(is_ipv6));
        delete_flows(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPVSADM_LIST: &str = "\
IP Virtual Server version 1.2.1 (size=4096)
Prot LocalAddress:Port Scheduler Flags
  -> RemoteAddress:Port           Forward Weight ActiveConn InActConn
TCP  10.0.0.5:80 rr persistent 10800
  -> 10.1.1.1:8080                Masq    1      3          1
  -> 10.1.1.2:8080                Masq    0      0          0
UDP  [fd00::a]:53 wrr
";

    #[test]
    fn parses_ipvsadm_listing() {
        let parsed = parse_ipvsadm_list(IPVSADM_LIST).unwrap();
        assert_eq!(parsed.len(), 2);

        let (vs, rss) = &parsed[0];
        assert_eq!(vs.to_string(), "10.0.0.5:80/TCP");
        assert!(vs.is_persistent());
        assert_eq!(vs.timeout, 10800);
        assert_eq!(rss.len(), 2);
        assert_eq!(rss[0].active_connections, 3);
        assert_eq!(rss[0].inactive_connections, 1);
        assert_eq!(rss[1].weight, 0);

        let (vs6, rss6) = &parsed[1];
        assert_eq!(vs6.to_string(), "[fd00::a]:53/UDP");
        assert_eq!(vs6.scheduler, "wrr");
        assert!(rss6.is_empty());
    }

    #[test]
    fn rejects_orphan_real_server() {
        assert!(parse_ipvsadm_list("  -> 10.1.1.1:8080 Masq 1 0 0\n").is_err());
    }

    #[test]
    fn ipvsadm_arguments() {
        let vs = VirtualServer::new("10.0.0.5".parse().unwrap(), 80, Protocol::Tcp, "rr")
            .with_affinity(Some(10800));
        assert_eq!(
            virtual_server_args("-A", &vs),
            args(&["-A", "-t", "10.0.0.5:80", "-s", "rr", "-p", "10800"])
        );
        let rs = RealServer::new("fd00::1".parse().unwrap(), 8080, 1);
        let vs6 = VirtualServer::new("fd00::5".parse().unwrap(), 53, Protocol::Udp, "rr");
        assert_eq!(
            real_server_args("-a", &vs6, &rs, true),
            args(&["-a", "-u", "[fd00::5]:53", "-r", "[fd00::1]:8080", "-m", "-w", "1"])
        );
        assert_eq!(
            real_server_args("-d", &vs6, &rs, false),
            args(&["-d", "-u", "[fd00::5]:53", "-r", "[fd00::1]:8080"])
        );
    }

    #[test]
    fn parses_ipset_members() {
        let out = "\
Name: K3RS-CLUSTER-IP
Type: hash:ip,port
Header: family inet hashsize 1024 maxelem 65536 comment
Members:
10.0.0.5,tcp:80 comment \"ns/svc:http\"
10.0.0.6,udp:53
";
        assert_eq!(
            parse_ipset_members(out),
            vec!["10.0.0.5,tcp:80".to_string(), "10.0.0.6,udp:53".to_string()]
        );
        assert!(parse_ipset_members("Name: X\nMembers:\n").is_empty());
    }

    #[test]
    fn parses_bound_addresses() {
        let out = "\
7: k3rs-ipvs0    inet 10.0.0.5/32 scope global k3rs-ipvs0\\       valid_lft forever preferred_lft forever
7: k3rs-ipvs0    inet6 fd00::5/128 scope global \\       valid_lft forever preferred_lft forever
";
        assert_eq!(parse_ip_addr_show(out), vec!["10.0.0.5".to_string(), "fd00::5".to_string()]);
    }

    #[test]
    fn host_prefix_by_family() {
        assert_eq!(host_prefix("10.0.0.5").unwrap(), "10.0.0.5/32");
        assert_eq!(host_prefix("fd00::5").unwrap(), "fd00::5/128");
        assert!(host_prefix("nope").is_err());
    }
}
