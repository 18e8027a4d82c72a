//! Network-related constants.

/// Default port for the k3rs API server.
pub const DEFAULT_API_PORT: u16 = 6443;

/// Default API server address (HTTP).
pub const DEFAULT_API_ADDR: &str = "http://127.0.0.1:6443";

/// Default service proxy health / metrics port.
pub const DEFAULT_SERVICE_PROXY_PORT: u16 = 10256;

/// Bind address for the proxy health / metrics server.
pub const DEFAULT_HEALTHZ_BIND_ADDR: &str = "0.0.0.0";

/// Bit used to mark packets that need SNAT (`1 << 14` = `0x4000`).
pub const DEFAULT_MASQUERADE_BIT: u32 = 14;

/// Zero CIDRs meaning "every address on this node".
pub const IPV4_ZERO_CIDR: &str = "0.0.0.0/0";
pub const IPV6_ZERO_CIDR: &str = "::/0";
