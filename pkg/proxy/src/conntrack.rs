use anyhow::Result;
use async_trait::async_trait;
use pkg_types::meta::Protocol;

/// Connection tracking table cleanup.
///
/// Connectionless flows keep hitting a dead backend until their conntrack
/// entry is removed, so stale UDP/SCTP state is flushed after each sync.
#[async_trait]
pub trait Conntrack: Send + Sync {
    /// Delete entries whose original destination is `ip`.
    async fn clear_entries_for_ip(&self, ip: &str, protocol: Protocol) -> Result<()>;

    /// Delete entries from `origin` that were NATed to `dest`.
    async fn clear_entries_for_nat(&self, origin: &str, dest: &str, protocol: Protocol)
    -> Result<()>;

    /// Delete entries whose original destination port is `port`.
    async fn clear_entries_for_port(&self, port: u16, is_ipv6: bool, protocol: Protocol)
    -> Result<()>;
}
