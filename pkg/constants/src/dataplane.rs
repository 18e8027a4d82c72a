//! Names of the kernel objects owned by the proxy (chains, sets, devices).

/// Dummy interface that every service VIP is bound to.
pub const DEFAULT_DUMMY_DEVICE: &str = "k3rs-ipvs0";

// ─── iptables chains ─────────────────────────────────────────────────────

pub const SERVICES_CHAIN: &str = "K3RS-SERVICES";
pub const POSTROUTING_CHAIN: &str = "K3RS-POSTROUTING";
pub const FIREWALL_CHAIN: &str = "K3RS-FIREWALL";
pub const NODE_PORT_CHAIN: &str = "K3RS-NODE-PORT";
pub const LOAD_BALANCER_CHAIN: &str = "K3RS-LOAD-BALANCER";
pub const MARK_MASQ_CHAIN: &str = "K3RS-MARK-MASQ";
pub const MARK_DROP_CHAIN: &str = "K3RS-MARK-DROP";
pub const FORWARD_CHAIN: &str = "K3RS-FORWARD";

// ─── ipsets ──────────────────────────────────────────────────────────────

pub const LOOP_BACK_IP_SET: &str = "K3RS-LOOP-BACK";
pub const CLUSTER_IP_SET: &str = "K3RS-CLUSTER-IP";
pub const EXTERNAL_IP_SET: &str = "K3RS-EXTERNAL-IP";
pub const EXTERNAL_IP_LOCAL_SET: &str = "K3RS-EXTERNAL-IP-LOCAL";
pub const LOAD_BALANCER_SET: &str = "K3RS-LOAD-BALANCER";
pub const LOAD_BALANCER_FW_SET: &str = "K3RS-LOAD-BALANCER-FW";
pub const LOAD_BALANCER_LOCAL_SET: &str = "K3RS-LOAD-BALANCER-LOCAL";
pub const LOAD_BALANCER_SOURCE_IP_SET: &str = "K3RS-LOAD-BALANCER-SOURCE-IP";
pub const LOAD_BALANCER_SOURCE_CIDR_SET: &str = "K3RS-LOAD-BALANCER-SOURCE-CIDR";
pub const NODE_PORT_TCP_SET: &str = "K3RS-NODE-PORT-TCP";
pub const NODE_PORT_LOCAL_TCP_SET: &str = "K3RS-NODE-PORT-LOCAL-TCP";
pub const NODE_PORT_UDP_SET: &str = "K3RS-NODE-PORT-UDP";
pub const NODE_PORT_LOCAL_UDP_SET: &str = "K3RS-NODE-PORT-LOCAL-UDP";
pub const NODE_PORT_SCTP_SET: &str = "K3RS-NODE-PORT-SCTP-HASH";
pub const NODE_PORT_LOCAL_SCTP_SET: &str = "K3RS-NODE-PORT-LOCAL-SCTP-HASH";
pub const HEALTH_CHECK_NODE_PORT_SET: &str = "K3RS-HEALTH-CHECK-NODE-PORT";
