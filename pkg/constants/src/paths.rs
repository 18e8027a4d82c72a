//! Filesystem path constants.

/// Default config file path for the service proxy.
pub const DEFAULT_PROXY_CONFIG: &str = "/etc/k3rs/proxy-config.yaml";

// ─── Dataplane tools ──────────────────────────────────────────────────────

pub const IPVSADM_BIN: &str = "ipvsadm";
pub const IPSET_BIN: &str = "ipset";
pub const IPTABLES_BIN: &str = "iptables";
pub const IPTABLES_RESTORE_BIN: &str = "iptables-restore";
pub const IP6TABLES_BIN: &str = "ip6tables";
pub const IP6TABLES_RESTORE_BIN: &str = "ip6tables-restore";
pub const IP_BIN: &str = "ip";
pub const CONNTRACK_BIN: &str = "conntrack";
