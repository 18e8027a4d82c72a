use anyhow::Result;
use pkg_metrics::MetricsRegistry;
use pkg_types::meta::Protocol;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::ipvs::{Ipvs, RealServer, VirtualServer, unique_rs_name};
use crate::lock;
use crate::metrics::GRACEFUL_TERMINATION_PENDING;

/// Lifecycle of a real server handed to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsState {
    /// Still installed and not queued for deletion.
    Active,
    /// Weight 0, waiting for its connections to drain.
    PendingDelete,
    /// No longer installed.
    Removed,
}

#[derive(Debug, Clone)]
struct PendingRs {
    vs: VirtualServer,
    rs: RealServer,
    /// Weight to restore if the real server comes back.
    weight: i32,
    enqueued: Instant,
}

/// Drains removed real servers before deleting them.
///
/// A real server is deleted right away when its protocol is connectionless or
/// it has no connections. Otherwise its weight drops to 0 and it is re-checked
/// every `check_interval` until it drains or `timeout` elapses.
///
/// Drain passes, hand-offs and rescues are serialized on `flush`, so a real
/// server taken back into service is never deleted by a pass already running.
pub struct GracefulTerminationManager {
    ipvs: Arc<dyn Ipvs>,
    pending: Mutex<BTreeMap<String, PendingRs>>,
    flush: tokio::sync::Mutex<()>,
    timeout: Duration,
    check_interval: Duration,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl GracefulTerminationManager {
    pub fn new(ipvs: Arc<dyn Ipvs>, timeout: Duration, check_interval: Duration) -> Self {
        Self {
            ipvs,
            pending: Mutex::new(BTreeMap::new()),
            flush: tokio::sync::Mutex::new(()),
            timeout,
            check_interval,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start the periodic re-check loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(mgr.check_interval);
            // The first tick fires immediately; nothing is queued yet.
            interval.tick().await;
            loop {
                interval.tick().await;
                mgr.try_delete_rs().await;
            }
        })
    }

    /// Whether `vs/rs` is queued for deletion.
    pub fn in_termination_list(&self, unique_rs: &str) -> bool {
        lock(&self.pending).contains_key(unique_rs)
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Hand a removed real server over for draining.
    pub async fn graceful_delete_rs(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        let _flush = self.flush.lock().await;
        let key = unique_rs_name(vs, rs);
        if self.in_termination_list(&key) {
            return Ok(());
        }
        if self.delete_if_drained(vs, rs, false).await? {
            return Ok(());
        }

        let drained = RealServer {
            weight: 0,
            ..rs.clone()
        };
        self.ipvs.update_real_server(vs, &drained).await?;
        info!("real server {} is draining before deletion", key);
        lock(&self.pending).insert(
            key,
            PendingRs {
                vs: vs.clone(),
                rs: drained,
                weight: rs.weight,
                enqueued: Instant::now(),
            },
        );
        self.report();
        Ok(())
    }

    /// Take a draining real server back into service.
    ///
    /// Returns false if it was not queued. Its weight is restored in place;
    /// it is never deleted and re-added.
    pub async fn rescue(&self, vs: &VirtualServer, rs: &RealServer) -> Result<bool> {
        let _flush = self.flush.lock().await;
        let key = unique_rs_name(vs, rs);
        let Some(item) = lock(&self.pending).remove(&key) else {
            return Ok(false);
        };
        self.report();
        let restored = RealServer {
            weight: if rs.weight > 0 { rs.weight } else { item.weight },
            ..item.rs
        };
        info!("real server {} is back in service", key);
        self.ipvs.update_real_server(&item.vs, &restored).await?;
        Ok(true)
    }

    /// Drop every queued real server of `vs`, which has been deleted.
    pub async fn forget_virtual_server(&self, vs: &VirtualServer) {
        let _flush = self.flush.lock().await;
        let dropped = {
            let mut pending = lock(&self.pending);
            let before = pending.len();
            pending.retain(|_, item| item.vs.to_string() != vs.to_string());
            before - pending.len()
        };
        if dropped > 0 {
            debug!("dropped {} draining real servers of deleted {}", dropped, vs);
            self.report();
        }
    }

    /// One pass over the queue: delete every drained or expired real server.
    pub async fn try_delete_rs(&self) {
        let _flush = self.flush.lock().await;
        let items: Vec<(String, PendingRs)> = lock(&self.pending)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if items.is_empty() {
            return;
        }
        let installed: Option<Vec<String>> = match self.ipvs.virtual_servers().await {
            Ok(list) => Some(list.iter().map(|vs| vs.to_string()).collect()),
            Err(e) => {
                warn!("failed to list IPVS virtual servers: {}", e);
                None
            }
        };

        for (key, item) in items {
            if installed
                .as_ref()
                .is_some_and(|list| !list.contains(&item.vs.to_string()))
            {
                info!("virtual server of {} is gone, dropping it", key);
                lock(&self.pending).remove(&key);
                continue;
            }
            match self.ipvs.real_servers(&item.vs).await {
                Ok(servers) => match servers.iter().find(|s| s.same_destination(&item.rs)) {
                    None => {
                        info!("real server {} is already gone", key);
                        lock(&self.pending).remove(&key);
                        continue;
                    }
                    Some(live) if live.weight != 0 => {
                        info!("real server {} was put back in service, dropping it", key);
                        lock(&self.pending).remove(&key);
                        continue;
                    }
                    Some(_) => {}
                },
                Err(e) => {
                    warn!("failed to list real servers of {}: {}", item.vs, e);
                    continue;
                }
            }

            let expired = item.enqueued.elapsed() >= self.timeout;
            match self.delete_if_drained(&item.vs, &item.rs, expired).await {
                Ok(true) => {
                    lock(&self.pending).remove(&key);
                }
                Ok(false) => debug!("real server {} still has connections", key),
                Err(e) => error!("failed to delete real server {}: {}", key, e),
            }
        }
        self.report();
    }

    /// Current lifecycle state of `vs/rs`.
    pub async fn state(&self, vs: &VirtualServer, rs: &RealServer) -> Result<RsState> {
        if self.in_termination_list(&unique_rs_name(vs, rs)) {
            return Ok(RsState::PendingDelete);
        }
        let installed = self.ipvs.real_servers(vs).await?;
        if installed.iter().any(|r| r.same_destination(rs)) {
            Ok(RsState::Active)
        } else {
            Ok(RsState::Removed)
        }
    }

    /// Delete `rs` if it may go now; `forced` skips the connection check.
    /// An unknown connection count counts as busy.
    async fn delete_if_drained(&self, vs: &VirtualServer, rs: &RealServer, forced: bool) -> Result<bool> {
        let connectionless = matches!(vs.protocol, Protocol::Udp | Protocol::Sctp);
        if !connectionless && !forced {
            match self.ipvs.connection_count(vs, rs).await {
                Ok(0) => {}
                Ok(n) => {
                    debug!("real server {}/{} has {} connections", vs, rs, n);
                    return Ok(false);
                }
                Err(e) => {
                    warn!("failed to count connections of {}/{}: {}", vs, rs, e);
                    return Ok(false);
                }
            }
        }
        if forced {
            warn!(
                "real server {}/{} did not drain within {:?}, deleting",
                vs, rs, self.timeout
            );
        }
        self.ipvs.delete_real_server(vs, rs).await?;
        info!("deleted real server {}/{}", vs, rs);
        Ok(true)
    }

    fn report(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.gauge_set(GRACEFUL_TERMINATION_PENDING, self.pending_len() as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeIpvs;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Delegates to a [`FakeIpvs`], pausing `connection_count` once armed.
    struct GatedIpvs {
        inner: Arc<FakeIpvs>,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Ipvs for GatedIpvs {
        async fn virtual_servers(&self) -> Result<Vec<VirtualServer>> {
            self.inner.virtual_servers().await
        }

        async fn add_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
            self.inner.add_virtual_server(vs).await
        }

        async fn update_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
            self.inner.update_virtual_server(vs).await
        }

        async fn delete_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
            self.inner.delete_virtual_server(vs).await
        }

        async fn real_servers(&self, vs: &VirtualServer) -> Result<Vec<RealServer>> {
            self.inner.real_servers(vs).await
        }

        async fn add_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
            self.inner.add_real_server(vs, rs).await
        }

        async fn update_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
            self.inner.update_real_server(vs, rs).await
        }

        async fn delete_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
            self.inner.delete_real_server(vs, rs).await
        }

        async fn connection_count(&self, vs: &VirtualServer, rs: &RealServer) -> Result<u64> {
            if self.armed.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.connection_count(vs, rs).await
        }
    }

    fn make_vs(protocol: Protocol) -> VirtualServer {
        VirtualServer::new("10.0.0.5".parse().unwrap(), 80, protocol, "rr")
    }

    fn make_rs() -> RealServer {
        RealServer::new("10.1.1.1".parse().unwrap(), 8080, 1)
    }

    async fn make_manager(protocol: Protocol, conns: u32) -> (Arc<FakeIpvs>, GracefulTerminationManager) {
        let ipvs = Arc::new(FakeIpvs::default());
        let vs = make_vs(protocol);
        ipvs.add_virtual_server(&vs).await.unwrap();
        ipvs.add_real_server(&vs, &make_rs()).await.unwrap();
        ipvs.set_connections(&vs, &make_rs(), conns);
        let mgr = GracefulTerminationManager::new(
            ipvs.clone(),
            Duration::from_secs(900),
            Duration::from_secs(60),
        );
        (ipvs, mgr)
    }

    #[tokio::test]
    async fn idle_real_server_is_deleted_at_once() {
        let (ipvs, mgr) = make_manager(Protocol::Tcp, 0).await;
        let vs = make_vs(Protocol::Tcp);
        mgr.graceful_delete_rs(&vs, &make_rs()).await.unwrap();
        assert_eq!(mgr.state(&vs, &make_rs()).await.unwrap(), RsState::Removed);
        assert_eq!(ipvs.calls("delete_real_server"), 1);
    }

    #[tokio::test]
    async fn udp_skips_draining() {
        let (_ipvs, mgr) = make_manager(Protocol::Udp, 5).await;
        let vs = make_vs(Protocol::Udp);
        mgr.graceful_delete_rs(&vs, &make_rs()).await.unwrap();
        assert_eq!(mgr.pending_len(), 0);
        assert_eq!(mgr.state(&vs, &make_rs()).await.unwrap(), RsState::Removed);
    }

    #[tokio::test]
    async fn busy_real_server_drains_then_goes() {
        let (ipvs, mgr) = make_manager(Protocol::Tcp, 3).await;
        let vs = make_vs(Protocol::Tcp);
        mgr.graceful_delete_rs(&vs, &make_rs()).await.unwrap();
        assert_eq!(mgr.state(&vs, &make_rs()).await.unwrap(), RsState::PendingDelete);
        assert_eq!(ipvs.real_servers(&vs).await.unwrap()[0].weight, 0);

        mgr.try_delete_rs().await;
        assert_eq!(mgr.pending_len(), 1);

        ipvs.set_connections(&vs, &make_rs(), 0);
        mgr.try_delete_rs().await;
        assert_eq!(mgr.state(&vs, &make_rs()).await.unwrap(), RsState::Removed);
    }

    #[tokio::test]
    async fn expired_real_server_is_forced_out() {
        let ipvs = Arc::new(FakeIpvs::default());
        let vs = make_vs(Protocol::Tcp);
        ipvs.add_virtual_server(&vs).await.unwrap();
        ipvs.add_real_server(&vs, &make_rs()).await.unwrap();
        ipvs.set_connections(&vs, &make_rs(), 7);
        let mgr = GracefulTerminationManager::new(ipvs.clone(), Duration::ZERO, Duration::from_secs(60));

        mgr.graceful_delete_rs(&vs, &make_rs()).await.unwrap();
        assert_eq!(mgr.pending_len(), 1);
        mgr.try_delete_rs().await;
        assert_eq!(mgr.pending_len(), 0);
        assert!(ipvs.real_servers(&vs).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rescue_restores_weight_without_readding() {
        let (ipvs, mgr) = make_manager(Protocol::Tcp, 3).await;
        let vs = make_vs(Protocol::Tcp);
        mgr.graceful_delete_rs(&vs, &make_rs()).await.unwrap();

        assert!(mgr.rescue(&vs, &make_rs()).await.unwrap());
        assert_eq!(mgr.state(&vs, &make_rs()).await.unwrap(), RsState::Active);
        assert_eq!(ipvs.real_servers(&vs).await.unwrap()[0].weight, 1);
        assert_eq!(ipvs.calls("add_real_server"), 1);
        assert_eq!(ipvs.calls("delete_real_server"), 0);

        assert!(!mgr.rescue(&vs, &make_rs()).await.unwrap());
    }

    #[tokio::test]
    async fn count_errors_keep_waiting() {
        let (ipvs, mgr) = make_manager(Protocol::Tcp, 3).await;
        let vs = make_vs(Protocol::Tcp);
        mgr.graceful_delete_rs(&vs, &make_rs()).await.unwrap();
        ipvs.fail_real_server_listing(true);
        mgr.try_delete_rs().await;
        assert_eq!(mgr.pending_len(), 1);
    }

    #[tokio::test]
    async fn unknown_count_still_drains() {
        let (ipvs, mgr) = make_manager(Protocol::Tcp, 3).await;
        let vs = make_vs(Protocol::Tcp);
        ipvs.fail_real_server_listing(true);
        mgr.graceful_delete_rs(&vs, &make_rs()).await.unwrap();
        ipvs.fail_real_server_listing(false);

        assert_eq!(mgr.pending_len(), 1);
        assert_eq!(ipvs.real_servers(&vs).await.unwrap()[0].weight, 0);
        assert_eq!(ipvs.calls("delete_real_server"), 0);
    }

    #[tokio::test]
    async fn rescue_waits_for_a_running_drain_pass() {
        let inner = Arc::new(FakeIpvs::default());
        let vs = make_vs(Protocol::Tcp);
        inner.add_virtual_server(&vs).await.unwrap();
        inner.add_real_server(&vs, &make_rs()).await.unwrap();
        inner.set_connections(&vs, &make_rs(), 3);
        let gated = Arc::new(GatedIpvs {
            inner: inner.clone(),
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let mgr = Arc::new(GracefulTerminationManager::new(
            gated.clone(),
            Duration::from_secs(900),
            Duration::from_secs(60),
        ));
        mgr.graceful_delete_rs(&vs, &make_rs()).await.unwrap();
        inner.set_connections(&vs, &make_rs(), 0);
        gated.armed.store(true, Ordering::SeqCst);

        let pass = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.try_delete_rs().await }
        });
        gated.entered.notified().await;
        let rescue = tokio::spawn({
            let mgr = mgr.clone();
            let vs = vs.clone();
            async move { mgr.rescue(&vs, &make_rs()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!rescue.is_finished());

        gated.release.notify_one();
        pass.await.unwrap();
        let rescued = rescue.await.unwrap().unwrap();

        let state = mgr.state(&vs, &make_rs()).await.unwrap();
        assert!(!rescued);
        assert_eq!(state, RsState::Removed);
        assert_eq!(mgr.pending_len(), 0);
    }

    #[tokio::test]
    async fn deleted_virtual_server_releases_its_queue() {
        let (ipvs, mgr) = make_manager(Protocol::Tcp, 3).await;
        let vs = make_vs(Protocol::Tcp);
        mgr.graceful_delete_rs(&vs, &make_rs()).await.unwrap();
        ipvs.delete_virtual_server(&vs).await.unwrap();

        mgr.try_delete_rs().await;
        assert_eq!(mgr.pending_len(), 0);

        ipvs.add_virtual_server(&vs).await.unwrap();
        ipvs.add_real_server(&vs, &make_rs()).await.unwrap();
        mgr.try_delete_rs().await;
        assert_eq!(mgr.state(&vs, &make_rs()).await.unwrap(), RsState::Active);
        assert_eq!(ipvs.calls("delete_real_server"), 0);
    }

    #[tokio::test]
    async fn real_server_back_in_service_is_not_deleted() {
        let (ipvs, mgr) = make_manager(Protocol::Tcp, 3).await;
        let vs = make_vs(Protocol::Tcp);
        mgr.graceful_delete_rs(&vs, &make_rs()).await.unwrap();
        ipvs.update_real_server(&vs, &make_rs()).await.unwrap();

        mgr.try_delete_rs().await;
        assert_eq!(mgr.pending_len(), 0);
        assert_eq!(mgr.state(&vs, &make_rs()).await.unwrap(), RsState::Active);
    }

    #[tokio::test]
    async fn forgetting_a_virtual_server_drops_its_entries() {
        let (ipvs, mgr) = make_manager(Protocol::Tcp, 3).await;
        let vs = make_vs(Protocol::Tcp);
        let other = VirtualServer::new("10.0.0.6".parse().unwrap(), 80, Protocol::Tcp, "rr");
        ipvs.add_virtual_server(&other).await.unwrap();
        ipvs.add_real_server(&other, &make_rs()).await.unwrap();
        ipvs.set_connections(&other, &make_rs(), 2);
        mgr.graceful_delete_rs(&vs, &make_rs()).await.unwrap();
        mgr.graceful_delete_rs(&other, &make_rs()).await.unwrap();

        mgr.forget_virtual_server(&vs).await;
        assert!(!mgr.in_termination_list(&unique_rs_name(&vs, &make_rs())));
        assert!(mgr.in_termination_list(&unique_rs_name(&other, &make_rs())));
    }
}
