use serde::{Deserialize, Serialize};

use crate::meta::IpFamily;

/// Service proxy configuration file (YAML).
///
/// Example `proxy-config.yaml`:
/// ```yaml
/// server: https://10.0.0.1:6443
/// token: my-secret-token
/// hostname: worker-1
/// sync-period: 30
/// min-sync-period: 1
/// scheduler: rr
/// cluster-cidr: 10.42.0.0/16
/// node-port-addresses: [192.168.1.0/24]
/// features:
///   terminating-endpoints-fallback: true
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfigFile {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, alias = "hostname-override")]
    pub hostname: Option<String>,
    #[serde(default, alias = "ip-family")]
    pub ip_family: Option<IpFamily>,
    /// Seconds between forced syncs.
    #[serde(default, alias = "sync-period")]
    pub sync_period: Option<u64>,
    /// Minimum seconds between two syncs.
    #[serde(default, alias = "min-sync-period")]
    pub min_sync_period: Option<u64>,
    #[serde(default)]
    pub scheduler: Option<String>,
    #[serde(default, alias = "masquerade-all")]
    pub masquerade_all: Option<bool>,
    #[serde(default, alias = "masquerade-bit")]
    pub masquerade_bit: Option<u32>,
    #[serde(default, alias = "cluster-cidr")]
    pub cluster_cidr: Option<String>,
    #[serde(default, alias = "node-port-addresses")]
    pub node_port_addresses: Option<Vec<String>>,
    #[serde(default, alias = "exclude-cidrs")]
    pub exclude_cidrs: Option<Vec<String>>,
    #[serde(default, alias = "healthz-port")]
    pub healthz_port: Option<u16>,
    /// Seconds a draining real server may hold connections before removal.
    #[serde(default, alias = "graceful-termination-timeout")]
    pub graceful_termination_timeout: Option<u64>,
    #[serde(default)]
    pub features: FeatureGatesFile,
}

/// Optional behaviours, all enabled unless turned off.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureGatesFile {
    #[serde(default, alias = "internal-traffic-policy")]
    pub internal_traffic_policy: Option<bool>,
    #[serde(default, alias = "topology-aware-hints")]
    pub topology_aware_hints: Option<bool>,
    #[serde(default, alias = "terminating-endpoints-fallback")]
    pub terminating_endpoints_fallback: Option<bool>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg: ProxyConfigFile =
            load_config_file("/nonexistent/k3rs/proxy-config.yaml").unwrap();
        assert!(cfg.server.is_none());
        assert!(cfg.features.terminating_endpoints_fallback.is_none());
    }

    #[test]
    fn parses_dashed_keys() {
        let yaml = r#"
hostname: worker-1
sync-period: 10
node-port-addresses: ["192.168.1.0/24"]
ip-family: IPv6
features:
  terminating-endpoints-fallback: false
"#;
        let cfg: ProxyConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.hostname.as_deref(), Some("worker-1"));
        assert_eq!(cfg.sync_period, Some(10));
        assert_eq!(cfg.ip_family, Some(IpFamily::IPv6));
        assert_eq!(
            cfg.node_port_addresses,
            Some(vec!["192.168.1.0/24".to_string()])
        );
        assert_eq!(cfg.features.terminating_endpoints_fallback, Some(false));
    }
}
