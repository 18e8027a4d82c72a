use anyhow::{Result, bail};
use ipnetwork::IpNetwork;
use std::net::IpAddr;

use crate::meta::IpFamily;

/// Parse an IP address, rejecting empty hosts.
pub fn parse_ip(ip: &str) -> Result<IpAddr> {
    let ip = ip.trim();
    if ip.is_empty() {
        bail!("IP address must not be empty");
    }
    ip.parse::<IpAddr>()
        .map_err(|_| anyhow::anyhow!("'{}' is not a valid IP address", ip))
}

/// Parse an IP address and require it to belong to `family`.
pub fn parse_ip_of_family(ip: &str, family: IpFamily) -> Result<IpAddr> {
    let addr = parse_ip(ip)?;
    if !family.matches(&addr) {
        bail!("IP '{}' is not an {} address", ip, family);
    }
    Ok(addr)
}

/// A port of zero is never a valid service or endpoint port.
pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        bail!("port must be in range 1-65535");
    }
    Ok(())
}

/// Parse a CIDR such as `10.0.0.0/8`.
pub fn parse_cidr(cidr: &str) -> Result<IpNetwork> {
    cidr.trim()
        .parse::<IpNetwork>()
        .map_err(|_| anyhow::anyhow!("'{}' is not a valid CIDR", cidr))
}

/// `0.0.0.0/0` and `::/0` select every address on the node.
pub fn is_zero_cidr(cidr: &str) -> bool {
    matches!(cidr.trim(), "0.0.0.0/0" | "::/0")
}

/// Split `host:port` (with IPv6 hosts in brackets) into its parts.
pub fn split_host_port(endpoint: &str) -> Result<(IpAddr, u16)> {
    let sock: std::net::SocketAddr = endpoint
        .parse()
        .map_err(|_| anyhow::anyhow!("'{}' is not a valid ip:port", endpoint))?;
    Ok((sock.ip(), sock.port()))
}

/// Join an IP and a port, bracketing IPv6 hosts.
pub fn join_host_port(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("[{}]:{}", ip, port)
    } else {
        format!("{}:{}", ip, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_addresses() {
        assert!(parse_ip("10.0.0.1").is_ok());
        assert!(parse_ip("fd00::1").is_ok());
        assert!(parse_ip_of_family("10.0.0.1", IpFamily::IPv4).is_ok());
        assert!(parse_cidr("10.42.0.0/16").is_ok());
        assert!(validate_port(80).is_ok());
    }

    #[test]
    fn invalid_addresses() {
        assert!(parse_ip("").is_err());
        assert!(parse_ip("10.0.0.256").is_err());
        assert!(parse_ip_of_family("fd00::1", IpFamily::IPv4).is_err());
        assert!(parse_cidr("10.42.0.0").is_err());
        assert!(validate_port(0).is_err());
    }

    #[test]
    fn host_port_round_trip() {
        assert_eq!(join_host_port("10.1.1.1", 8080), "10.1.1.1:8080");
        assert_eq!(join_host_port("fd00::1", 53), "[fd00::1]:53");
        let (ip, port) = split_host_port("[fd00::1]:53").unwrap();
        assert_eq!(ip.to_string(), "fd00::1");
        assert_eq!(port, 53);
        assert!(split_host_port("10.1.1.1").is_err());
    }

    #[test]
    fn zero_cidrs() {
        assert!(is_zero_cidr("0.0.0.0/0"));
        assert!(is_zero_cidr("::/0"));
        assert!(!is_zero_cidr("10.0.0.0/8"));
    }
}
