//! The IPVS proxier: folds watch events into service and endpoint maps and
//! converges the node's dataplane to them.
//!
//! One sync pass derives the full desired state (ipset members, virtual
//! servers, reserved ports) from the maps, applies the iptables payload
//! atomically, and only then touches ipsets and IPVS. A failed restore
//! leaves IPVS untouched and releases the ports reserved by the pass.

use chrono::Utc;
use pkg_constants::dataplane as dp;
use pkg_metrics::MetricsRegistry;
use pkg_types::endpoint::{EndpointSlice, Endpoints};
use pkg_types::meta::{IpFamily, Protocol};
use pkg_types::node::Node;
use pkg_types::service::Service;
use pkg_types::validate::{is_zero_cidr, split_host_port};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ProxierConfig;
use crate::conntrack::Conntrack;
use crate::endpoints::{
    Endpoint, EndpointChangeTracker, EndpointsMap, MakeEndpointFn, ServiceEndpoint,
    UpdateEndpointMapResult,
};
use crate::graceful_termination::GracefulTerminationManager;
use crate::healthcheck::{ProxierHealthServer, ServiceHealthServer};
use crate::ipset::{Entry, IpSetBackend, ProxyIpSet, proxy_ipsets};
use crate::iptables::{ENSURE_CHAINS, Iptables, JUMP_CHAINS, RulePosition, write_iptables_rules};
use crate::ipvs::{Ipvs, RealServer, VirtualServer, unique_rs_name};
use crate::metrics::*;
use crate::netlink::{IpGetter, NetlinkHandle, node_addresses};
use crate::port::{LocalPort, PortMap, PortOpener, revert_ports};
use crate::runner::BoundedFrequencyRunner;
use crate::service::{MakeServicePortFn, ServiceChangeTracker, ServiceMap, ServicePort, ServicePortName};
use crate::topology::filter_endpoints;

/// The dataplane and reporting seams a [`Proxier`] drives.
#[derive(Clone)]
pub struct Backends {
    pub ipvs: Arc<dyn Ipvs>,
    pub ipset: Arc<dyn IpSetBackend>,
    pub iptables: Arc<dyn Iptables>,
    pub netlink: Arc<dyn NetlinkHandle>,
    pub port_opener: Arc<dyn PortOpener>,
    pub conntrack: Arc<dyn Conntrack>,
    pub ip_getter: Arc<dyn IpGetter>,
    pub health: Arc<dyn ServiceHealthServer>,
}

/// Optional hooks rewriting projected service ports and endpoints.
#[derive(Default)]
pub struct Factories {
    pub make_service_port: Option<MakeServicePortFn>,
    pub make_endpoint: Option<MakeEndpointFn>,
}

/// State owned by the sync loop.
struct ProxierState {
    service_map: ServiceMap,
    endpoints_map: EndpointsMap,
    port_map: PortMap,
    node_labels: HashMap<String, String>,
    ipsets: BTreeMap<&'static str, ProxyIpSet>,
    /// Last payload iptables-restore accepted.
    last_restore: Option<Vec<u8>>,
    initial_sync: bool,
    /// Service IPs whose conntrack entries are flushed after the next
    /// successful pass.
    stale_service_ips: BTreeSet<(String, Protocol)>,
    /// `(origin, endpoint)` NAT entries owed the same way.
    stale_nat: BTreeSet<(String, String, Protocol)>,
}

/// A virtual server the current pass wants installed.
struct DesiredService {
    spn: ServicePortName,
    vs: VirtualServer,
    /// Bind the VIP to the dummy device.
    bind: bool,
    /// Only route to endpoints on this node.
    node_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reservation {
    Opened,
    Held,
    Failed,
}

/// Everything derived from the maps before anything is applied.
#[derive(Default)]
struct SyncPlan {
    services: Vec<DesiredService>,
    active_services: HashSet<String>,
    active_bind_addrs: BTreeSet<String>,
    /// Ports this pass still needs that were already held.
    kept_ports: HashSet<LocalPort>,
    new_ports: PortMap,
    fresh_udp_node_ports: BTreeSet<u16>,
}

/// Background loops of a running [`Proxier`]; both stop when this is dropped.
pub struct SyncTasks {
    runner: JoinHandle<()>,
    drain: JoinHandle<()>,
}

impl SyncTasks {
    pub fn abort(&self) {
        self.runner.abort();
        self.drain.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.runner.is_finished() && self.drain.is_finished()
    }
}

impl Drop for SyncTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

pub struct Proxier {
    config: ProxierConfig,
    service_changes: ServiceChangeTracker,
    endpoints_changes: EndpointChangeTracker,
    backends: Backends,
    graceful: Arc<GracefulTerminationManager>,
    state: Mutex<ProxierState>,
    services_synced: AtomicBool,
    endpoint_slices_synced: AtomicBool,
    initialized: AtomicBool,
    runner: Arc<BoundedFrequencyRunner>,
    metrics: Arc<MetricsRegistry>,
    healthz: Option<Arc<ProxierHealthServer>>,
}

impl Proxier {
    pub fn new(
        config: ProxierConfig,
        backends: Backends,
        metrics: Arc<MetricsRegistry>,
        factories: Factories,
    ) -> Self {
        register_metrics(&metrics);
        let graceful = Arc::new(
            GracefulTerminationManager::new(
                backends.ipvs.clone(),
                config.graceful_termination_timeout,
                config.rs_check_interval,
            )
            .with_metrics(metrics.clone()),
        );
        let runner = BoundedFrequencyRunner::new(
            "sync-runner",
            config.min_sync_period,
            config.sync_period,
        );
        info!(
            "creating {} IPVS proxier for node {} (scheduler {})",
            config.ip_family, config.hostname, config.scheduler
        );
        Self {
            service_changes: ServiceChangeTracker::new(
                config.ip_family,
                config.features,
                factories.make_service_port,
                None,
            ),
            endpoints_changes: EndpointChangeTracker::new(
                config.hostname.clone(),
                config.ip_family,
                factories.make_endpoint,
                None,
            ),
            state: Mutex::new(ProxierState {
                service_map: ServiceMap::new(),
                endpoints_map: EndpointsMap::new(),
                port_map: PortMap::new(),
                node_labels: HashMap::new(),
                ipsets: proxy_ipsets(config.ip_family),
                last_restore: None,
                initial_sync: true,
                stale_service_ips: BTreeSet::new(),
                stale_nat: BTreeSet::new(),
            }),
            config,
            backends,
            graceful,
            services_synced: AtomicBool::new(false),
            endpoint_slices_synced: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            runner,
            metrics,
            healthz: None,
        }
    }

    pub fn with_health_server(mut self, healthz: Arc<ProxierHealthServer>) -> Self {
        self.healthz = Some(healthz);
        self
    }

    pub fn config(&self) -> &ProxierConfig {
        &self.config
    }

    /// Start the coalescing sync loop and the graceful termination loop.
    pub fn sync_runner(self: &Arc<Self>) -> SyncTasks {
        let drain = self.graceful.start();
        let proxier = Arc::clone(self);
        let runner = self.runner.start(move || {
            let proxier = proxier.clone();
            async move { proxier.sync_proxy_rules().await }
        });
        SyncTasks { runner, drain }
    }

    /// Request a sync pass.
    pub fn sync(&self) {
        if let Some(healthz) = &self.healthz {
            healthz.queued();
        }
        self.runner.run();
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn set_initialized(&self) {
        let ready = self.services_synced.load(Ordering::SeqCst)
            && self.endpoint_slices_synced.load(Ordering::SeqCst);
        self.initialized.store(ready, Ordering::SeqCst);
    }

    // ─── Event handlers ──────────────────────────────────────────────────

    pub fn on_service_add(&self, service: &Service) {
        self.on_service_update(None, Some(service));
    }

    pub fn on_service_update(&self, previous: Option<&Service>, current: Option<&Service>) {
        self.metrics.counter_inc(SERVICE_CHANGES_TOTAL);
        let pending = self.service_changes.update(previous, current);
        self.metrics
            .gauge_set(SERVICE_CHANGES_PENDING, self.service_changes.pending() as i64);
        if pending && self.is_initialized() {
            self.sync();
        }
    }

    pub fn on_service_delete(&self, service: &Service) {
        self.on_service_update(Some(service), None);
    }

    pub fn on_services_synced(&self) {
        self.services_synced.store(true, Ordering::SeqCst);
        self.set_initialized();
        self.sync();
    }

    pub fn on_endpoints_add(&self, endpoints: &Endpoints) {
        self.on_endpoints_update(None, Some(endpoints));
    }

    pub fn on_endpoints_update(&self, previous: Option<&Endpoints>, current: Option<&Endpoints>) {
        self.metrics.counter_inc(ENDPOINT_CHANGES_TOTAL);
        let pending = self.endpoints_changes.update(previous, current);
        self.report_endpoint_pending();
        if pending && self.is_initialized() {
            self.sync();
        }
    }

    pub fn on_endpoints_delete(&self, endpoints: &Endpoints) {
        self.on_endpoints_update(Some(endpoints), None);
    }

    pub fn on_endpoint_slice_add(&self, slice: &EndpointSlice) {
        self.on_endpoint_slice_change(slice, false);
    }

    pub fn on_endpoint_slice_update(&self, _previous: &EndpointSlice, current: &EndpointSlice) {
        self.on_endpoint_slice_change(current, false);
    }

    pub fn on_endpoint_slice_delete(&self, slice: &EndpointSlice) {
        self.on_endpoint_slice_change(slice, true);
    }

    fn on_endpoint_slice_change(&self, slice: &EndpointSlice, remove: bool) {
        self.metrics.counter_inc(ENDPOINT_CHANGES_TOTAL);
        let pending = self.endpoints_changes.endpoint_slice_update(slice, remove);
        self.report_endpoint_pending();
        if pending && self.is_initialized() {
            self.sync();
        }
    }

    pub fn on_endpoint_slices_synced(&self) {
        self.endpoint_slices_synced.store(true, Ordering::SeqCst);
        self.set_initialized();
        self.sync();
    }

    fn report_endpoint_pending(&self) {
        self.metrics
            .gauge_set(ENDPOINT_CHANGES_PENDING, self.endpoints_changes.pending() as i64);
    }

    pub async fn on_node_add(&self, node: &Node) {
        self.set_node_labels(node, node.labels.clone()).await;
    }

    pub async fn on_node_update(&self, _previous: &Node, current: &Node) {
        self.set_node_labels(current, current.labels.clone()).await;
    }

    pub async fn on_node_delete(&self, node: &Node) {
        self.set_node_labels(node, HashMap::new()).await;
    }

    async fn set_node_labels(&self, node: &Node, labels: HashMap<String, String>) {
        if node.name != self.config.hostname {
            warn!(
                "received event for node {}, but this proxier serves {}",
                node.name, self.config.hostname
            );
            return;
        }
        {
            let mut state = self.state.lock().await;
            if state.node_labels == labels {
                return;
            }
            info!("labels of node {} changed", node.name);
            state.node_labels = labels;
        }
        self.sync();
    }

    // ─── Sync ────────────────────────────────────────────────────────────

    /// One full reconciliation pass.
    pub async fn sync_proxy_rules(&self) {
        if !self.is_initialized() {
            debug!("not syncing IPVS rules until services and endpoints have been received");
            return;
        }
        let start = Instant::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let svc_result = state.service_map.update(&self.service_changes);
        let ep_result = state.endpoints_map.update(&self.endpoints_changes);
        self.metrics.gauge_set(SERVICE_CHANGES_PENDING, 0);
        self.metrics.gauge_set(ENDPOINT_CHANGES_PENDING, 0);

        self.record_stale(state, &svc_result.udp_stale_cluster_ip, &ep_result);

        debug!("syncing IPVS proxy rules");
        let applied = self.apply(state).await;

        // Health counts follow the maps whether or not the rules went in.
        if let Err(e) = self
            .backends
            .health
            .sync_services(svc_result.hc_service_node_ports.clone())
            .await
        {
            error!("failed to sync service health checks: {}", e);
        }
        if let Err(e) = self
            .backends
            .health
            .sync_endpoints(ep_result.hc_endpoints_local_ip_size.clone())
            .await
        {
            error!("failed to sync service health check endpoints: {}", e);
        }
        if !applied {
            return;
        }

        self.flush_conntrack(state).await;

        let now = Utc::now();
        for times in ep_result.last_change_trigger_times.values() {
            for t in times {
                let latency = now.signed_duration_since(*t).num_milliseconds() as f64 / 1000.0;
                self.metrics
                    .histogram_observe(NETWORK_PROGRAMMING_DURATION, latency.max(0.0));
            }
        }

        let elapsed = start.elapsed();
        self.metrics.counter_inc(SYNC_PROXY_RULES_TOTAL);
        self.metrics
            .histogram_observe(SYNC_PROXY_RULES_DURATION, elapsed.as_secs_f64());
        self.metrics
            .gauge_set(SYNC_PROXY_RULES_LAST_TIMESTAMP, now.timestamp());
        if let Some(healthz) = &self.healthz {
            healthz.updated();
        }
        debug!(
            "synced {} service ports, {} endpoint groups in {:?}",
            state.service_map.len(),
            state.endpoints_map.len(),
            elapsed
        );
    }

    /// Queue the conntrack cleanup owed for what this pass removed.
    fn record_stale(
        &self,
        state: &mut ProxierState,
        udp_stale_cluster_ips: &HashSet<String>,
        ep_result: &UpdateEndpointMapResult,
    ) {
        for ip in udp_stale_cluster_ips {
            state.stale_service_ips.insert((ip.clone(), Protocol::Udp));
        }
        for spn in &ep_result.stale_service_names {
            let Some(svc) = state.service_map.get(spn) else {
                continue;
            };
            if !svc.protocol.needs_conntrack_clear() {
                continue;
            }
            state
                .stale_service_ips
                .insert((svc.cluster_ip.to_string(), svc.protocol));
            for ip in &svc.external_ips {
                state.stale_service_ips.insert((ip.clone(), svc.protocol));
            }
        }
        let nat = stale_nat_entries(&state.service_map, &ep_result.stale_endpoints);
        state.stale_nat.extend(nat);
    }

    /// Install the rules for the current maps. Returns false when the pass
    /// stopped before touching IPVS.
    async fn apply(&self, state: &mut ProxierState) -> bool {
        if let Err(e) = self.ensure_scaffolding(state).await {
            error!("failed to set up IPVS proxy scaffolding: {}", e);
            return false;
        }

        let bound: BTreeSet<String> = match self
            .backends
            .netlink
            .list_bind_address(&self.config.dummy_device)
            .await
        {
            Ok(addrs) => addrs.into_iter().collect(),
            Err(e) => {
                error!("failed to list addresses bound to {}: {}", self.config.dummy_device, e);
                BTreeSet::new()
            }
        };
        let mut installed: HashMap<String, VirtualServer> =
            match self.backends.ipvs.virtual_servers().await {
                Ok(list) => list.into_iter().map(|vs| (vs.to_string(), vs)).collect(),
                Err(e) => {
                    error!("failed to list IPVS virtual servers: {}", e);
                    HashMap::new()
                }
            };

        let mut plan = self.derive(state);

        let payload = write_iptables_rules(&state.ipsets, &self.config).into_bytes();
        if state.last_restore.as_deref() == Some(payload.as_slice()) {
            debug!("iptables rules unchanged, skipping restore");
        } else if let Err(e) = self.backends.iptables.restore_all(&payload).await {
            error!("failed to execute iptables-restore: {}", e);
            self.metrics.counter_inc(IPTABLES_RESTORE_FAILURES_TOTAL);
            state.last_restore = None;
            revert_ports(&mut plan.new_ports, &state.port_map);
            return false;
        } else {
            state.last_restore = Some(payload);
        }

        for set in state.ipsets.values() {
            set.sync_entries(self.backends.ipset.as_ref()).await;
        }

        let mut bound_now = bound.clone();
        for desired in &plan.services {
            match self
                .sync_service(&desired.vs, desired.bind, &mut installed, &mut bound_now)
                .await
            {
                Ok(()) => {
                    if let Err(e) = self
                        .sync_endpoint(state, &desired.spn, desired.node_local, &desired.vs)
                        .await
                    {
                        error!(
                            "failed to sync endpoints of {} on {}: {}",
                            desired.spn, desired.vs, e
                        );
                    }
                }
                Err(e) => error!("failed to sync service {} ({}): {}", desired.spn, desired.vs, e),
            }
        }
        state.initial_sync = false;

        self.commit_ports(state, &mut plan);
        for port in &plan.fresh_udp_node_ports {
            let is_ipv6 = self.config.ip_family == IpFamily::IPv6;
            if let Err(e) = self
                .backends
                .conntrack
                .clear_entries_for_port(*port, is_ipv6, Protocol::Udp)
                .await
            {
                error!("failed to clear conntrack entries for UDP port {}: {}", port, e);
            }
        }

        self.clean_legacy(&plan, &installed, &bound).await;
        true
    }

    /// Flush the conntrack entries queued by [`Self::record_stale`].
    async fn flush_conntrack(&self, state: &mut ProxierState) {
        for (ip, protocol) in std::mem::take(&mut state.stale_service_ips) {
            if let Err(e) = self
                .backends
                .conntrack
                .clear_entries_for_ip(&ip, protocol)
                .await
            {
                error!("failed to clear conntrack entries for {}: {}", ip, e);
            }
        }
        for (origin, endpoint_ip, protocol) in std::mem::take(&mut state.stale_nat) {
            if let Err(e) = self
                .backends
                .conntrack
                .clear_entries_for_nat(&origin, &endpoint_ip, protocol)
                .await
            {
                error!(
                    "failed to clear conntrack entries {} -> {}: {}",
                    origin, endpoint_ip, e
                );
            }
        }
    }

    async fn ensure_scaffolding(&self, state: &ProxierState) -> anyhow::Result<()> {
        let iptables = &self.backends.iptables;
        for (table, chain) in ENSURE_CHAINS {
            iptables.ensure_chain(*table, chain).await?;
        }
        for (table, from, to, comment) in JUMP_CHAINS {
            iptables.ensure_chain(*table, to).await?;
            let rule = vec![
                "-m".to_string(),
                "comment".to_string(),
                "--comment".to_string(),
                comment.to_string(),
                "-j".to_string(),
                to.to_string(),
            ];
            iptables
                .ensure_rule(RulePosition::Prepend, *table, from, &rule)
                .await?;
        }
        self.backends
            .netlink
            .ensure_dummy_device(&self.config.dummy_device)
            .await?;
        for set in state.ipsets.values() {
            self.backends.ipset.ensure_set(&set.set).await?;
        }
        Ok(())
    }

    /// Node addresses serving node ports, and the concrete node IPs behind them.
    fn node_addresses(&self) -> (BTreeSet<String>, Vec<IpAddr>) {
        let getter = self.backends.ip_getter.as_ref();
        let family = self.config.ip_family;
        let addresses: BTreeSet<String> =
            match node_addresses(&self.config.node_port_addresses, getter) {
                Ok(all) => all
                    .into_iter()
                    .filter(|a| match a.parse::<ipnetwork::IpNetwork>() {
                        Ok(net) => family.matches(&net.ip()),
                        Err(_) => family.matches_str(a),
                    })
                    .collect(),
                Err(e) => {
                    error!("failed to get node addresses: {}", e);
                    return (BTreeSet::new(), Vec::new());
                }
            };
        let mut ips = Vec::new();
        for address in &addresses {
            if is_zero_cidr(address) {
                match getter.node_ips() {
                    Ok(all) => ips = all,
                    Err(e) => error!("failed to list node IPs: {}", e),
                }
                break;
            }
            if let Ok(ip) = address.parse::<IpAddr>() {
                ips.push(ip);
            }
        }
        ips.retain(|ip| family.matches(ip) && !ip.is_loopback() && !is_link_local(ip));
        (addresses, ips)
    }

    /// Reserve `lp`, reusing the socket of a previous pass when there is one.
    fn reserve_port(&self, state: &ProxierState, plan: &mut SyncPlan, lp: LocalPort) -> Reservation {
        if state.port_map.contains_key(&lp) {
            plan.kept_ports.insert(lp);
            return Reservation::Held;
        }
        if plan.new_ports.contains_key(&lp) {
            return Reservation::Held;
        }
        match self.backends.port_opener.open_local_port(&lp) {
            Ok(socket) => {
                plan.new_ports.insert(lp, socket);
                Reservation::Opened
            }
            Err(e) => {
                error!("can't open local port {}, skipping it: {}", lp, e);
                Reservation::Failed
            }
        }
    }

    /// Fill the ipsets and collect the virtual servers and ports the maps call for.
    fn derive(&self, state: &mut ProxierState) -> SyncPlan {
        let mut plan = SyncPlan::default();
        for set in state.ipsets.values_mut() {
            set.active_entries.clear();
        }

        let has_node_port = state.service_map.iter().any(|(_, svc)| svc.node_port != 0);
        let (node_addrs, node_ips) = if has_node_port {
            self.node_addresses()
        } else {
            (BTreeSet::new(), Vec::new())
        };
        let local_ips: HashSet<IpAddr> = match self.backends.ip_getter.node_ips() {
            Ok(ips) => ips.into_iter().collect(),
            Err(e) => {
                error!("failed to list local IPs: {}", e);
                HashSet::new()
            }
        };

        let mut services: Vec<(ServicePortName, ServicePort)> = state
            .service_map
            .iter()
            .map(|(spn, svc)| (spn.clone(), svc.clone()))
            .collect();
        services.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));

        for (spn, svc) in services {
            let proto = svc.protocol.lowercase();
            let make_vs = |address: IpAddr, port: u16| {
                VirtualServer::new(address, port, svc.protocol, &self.config.scheduler)
                    .with_affinity(svc.session_affinity_seconds)
            };

            // Hairpin: local endpoints reaching themselves through the VIP.
            if let Some(eps) = state.endpoints_map.get(&spn) {
                for ep in eps.iter().filter(|e| e.is_local) {
                    let (Some(ip), Some(port)) = (ep.ip(), ep.port()) else {
                        continue;
                    };
                    let ip = ip.to_string();
                    insert_entry(&mut state.ipsets, dp::LOOP_BACK_IP_SET, &Entry::ip_port_ip(&ip, port, proto, &ip));
                }
            }

            // Cluster IP.
            let cluster_ip = svc.cluster_ip.to_string();
            if !insert_entry(&mut state.ipsets, dp::CLUSTER_IP_SET, &Entry::ip_port(&cluster_ip, svc.port, proto)) {
                continue;
            }
            plan.push(DesiredService {
                spn: spn.clone(),
                vs: make_vs(svc.cluster_ip, svc.port),
                bind: true,
                node_local: svc.node_local_internal,
            });

            // External IPs.
            for external_ip in &svc.external_ips {
                let Ok(address) = external_ip.parse::<IpAddr>() else {
                    continue;
                };
                if svc.protocol != Protocol::Sctp && local_ips.contains(&address) {
                    let lp = LocalPort::new(
                        format!("externalIP for {}", spn),
                        external_ip.clone(),
                        self.config.ip_family,
                        svc.port,
                        svc.protocol,
                    );
                    if self.reserve_port(state, &mut plan, lp) == Reservation::Failed {
                        continue;
                    }
                }
                let set = if svc.node_local_external {
                    dp::EXTERNAL_IP_LOCAL_SET
                } else {
                    dp::EXTERNAL_IP_SET
                };
                if !insert_entry(&mut state.ipsets, set, &Entry::ip_port(external_ip, svc.port, proto)) {
                    continue;
                }
                plan.push(DesiredService {
                    spn: spn.clone(),
                    vs: make_vs(address, svc.port),
                    bind: true,
                    node_local: svc.node_local_external,
                });
            }

            // Load balancer ingress.
            for ingress in &svc.load_balancer_ips {
                let Ok(address) = ingress.parse::<IpAddr>() else {
                    continue;
                };
                let entry = Entry::ip_port(ingress, svc.port, proto);
                if !insert_entry(&mut state.ipsets, dp::LOAD_BALANCER_SET, &entry) {
                    continue;
                }
                if svc.node_local_external {
                    insert_entry(&mut state.ipsets, dp::LOAD_BALANCER_LOCAL_SET, &entry);
                }
                if !svc.load_balancer_source_ranges.is_empty() {
                    if !insert_entry(&mut state.ipsets, dp::LOAD_BALANCER_FW_SET, &entry) {
                        continue;
                    }
                    let mut allow_from_node = false;
                    for src in &svc.load_balancer_source_ranges {
                        let cidr = Entry::ip_port_net(ingress, svc.port, proto, src);
                        insert_entry(&mut state.ipsets, dp::LOAD_BALANCER_SOURCE_CIDR_SET, &cidr);
                        if let (Ok(net), Some(node_ip)) =
                            (src.parse::<ipnetwork::IpNetwork>(), self.config.node_ip)
                            && net.contains(node_ip)
                        {
                            allow_from_node = true;
                        }
                    }
                    if allow_from_node {
                        insert_entry(
                            &mut state.ipsets,
                            dp::LOAD_BALANCER_SOURCE_IP_SET,
                            &Entry::ip_port_ip(ingress, svc.port, proto, ingress),
                        );
                    }
                }
                plan.push(DesiredService {
                    spn: spn.clone(),
                    vs: make_vs(address, svc.port),
                    bind: true,
                    node_local: svc.node_local_external,
                });
            }

            // Node port.
            if svc.node_port != 0 {
                if node_addrs.is_empty() || node_ips.is_empty() {
                    warn!("skipping node port of {}: no usable node addresses", spn);
                } else {
                    self.derive_node_port(state, &mut plan, &spn, &svc, &node_addrs, &node_ips, &make_vs);
                }
            }

            if svc.health_check_node_port != 0 {
                insert_entry(
                    &mut state.ipsets,
                    dp::HEALTH_CHECK_NODE_PORT_SET,
                    &Entry::port(svc.health_check_node_port, "tcp"),
                );
            }
        }
        plan
    }

    #[allow(clippy::too_many_arguments)]
    fn derive_node_port(
        &self,
        state: &mut ProxierState,
        plan: &mut SyncPlan,
        spn: &ServicePortName,
        svc: &ServicePort,
        node_addrs: &BTreeSet<String>,
        node_ips: &[IpAddr],
        make_vs: &dyn Fn(IpAddr, u16) -> VirtualServer,
    ) {
        let proto = svc.protocol.lowercase();
        if svc.protocol != Protocol::Sctp {
            for address in node_addrs {
                let ip = if is_zero_cidr(address) {
                    String::new()
                } else {
                    address.clone()
                };
                let lp = LocalPort::new(
                    format!("nodePort for {}", spn),
                    ip.clone(),
                    self.config.ip_family,
                    svc.node_port,
                    svc.protocol,
                );
                if self.reserve_port(state, plan, lp) == Reservation::Opened
                    && svc.protocol == Protocol::Udp
                {
                    plan.fresh_udp_node_ports.insert(svc.node_port);
                }
                if ip.is_empty() {
                    break;
                }
            }
        }

        let (set, local_set, entries) = match svc.protocol {
            Protocol::Tcp => (
                dp::NODE_PORT_TCP_SET,
                dp::NODE_PORT_LOCAL_TCP_SET,
                vec![Entry::port(svc.node_port, proto)],
            ),
            Protocol::Udp => (
                dp::NODE_PORT_UDP_SET,
                dp::NODE_PORT_LOCAL_UDP_SET,
                vec![Entry::port(svc.node_port, proto)],
            ),
            Protocol::Sctp => (
                dp::NODE_PORT_SCTP_SET,
                dp::NODE_PORT_LOCAL_SCTP_SET,
                node_ips
                    .iter()
                    .map(|ip| Entry::ip_port(&ip.to_string(), svc.node_port, proto))
                    .collect(),
            ),
        };
        for entry in &entries {
            if !insert_entry(&mut state.ipsets, set, entry) {
                return;
            }
        }
        if svc.node_local_external {
            for entry in &entries {
                if !insert_entry(&mut state.ipsets, local_set, entry) {
                    return;
                }
            }
        }
        for ip in node_ips {
            plan.push(DesiredService {
                spn: spn.clone(),
                vs: make_vs(*ip, svc.node_port),
                bind: false,
                node_local: svc.node_local_external,
            });
        }
    }

    /// Create or update `vs`, then bind its address when asked to.
    async fn sync_service(
        &self,
        vs: &VirtualServer,
        bind: bool,
        installed: &mut HashMap<String, VirtualServer>,
        bound: &mut BTreeSet<String>,
    ) -> anyhow::Result<()> {
        let key = vs.to_string();
        match installed.get(&key) {
            None => {
                info!("adding new IPVS service {}", vs);
                self.backends.ipvs.add_virtual_server(vs).await?;
                installed.insert(key, vs.clone());
            }
            Some(applied) if !applied.same_config(vs) => {
                info!("IPVS service {} changed, updating", vs);
                self.backends.ipvs.update_virtual_server(vs).await?;
                installed.insert(key, vs.clone());
            }
            Some(_) => {}
        }
        if bind {
            let address = vs.address.to_string();
            if !bound.contains(&address) {
                debug!("binding address {} to {}", address, self.config.dummy_device);
                self.backends
                    .netlink
                    .ensure_address_bind(&address, &self.config.dummy_device)
                    .await?;
                bound.insert(address);
            }
        }
        Ok(())
    }

    /// Endpoints of `spn` that should be real servers of its virtual servers.
    fn desired_endpoints(
        &self,
        state: &ProxierState,
        spn: &ServicePortName,
        node_local: bool,
    ) -> Vec<Endpoint> {
        let Some(endpoints) = state.endpoints_map.get(spn) else {
            return Vec::new();
        };
        let endpoints = match state.service_map.get(spn) {
            Some(svc) => filter_endpoints(endpoints, svc, &state.node_labels, &self.config.features),
            None => endpoints.clone(),
        };
        if !node_local {
            return endpoints.into_iter().filter(|e| e.ready).collect();
        }
        let local_ready: Vec<Endpoint> = endpoints
            .iter()
            .filter(|e| e.is_local && e.ready)
            .cloned()
            .collect();
        if !local_ready.is_empty() || !self.config.features.terminating_endpoints_fallback {
            return local_ready;
        }
        endpoints
            .into_iter()
            .filter(|e| e.is_local && !e.ready && e.serving && e.terminating)
            .collect()
    }

    /// Reconcile the real servers of one virtual server.
    async fn sync_endpoint(
        &self,
        state: &ProxierState,
        spn: &ServicePortName,
        node_local: bool,
        vs: &VirtualServer,
    ) -> anyhow::Result<()> {
        let current = self.backends.ipvs.real_servers(vs).await?;
        let mut desired: BTreeMap<(IpAddr, u16), RealServer> = BTreeMap::new();
        for ep in self.desired_endpoints(state, spn, node_local) {
            match (ep.ip(), ep.port()) {
                (Some(ip), Some(port)) => {
                    desired.insert((ip, port), RealServer::new(ip, port, 1));
                }
                _ => error!("failed to parse endpoint {} of {}", ep, spn),
            }
        }

        for (key, rs) in &desired {
            let existing = current.iter().find(|c| (c.address, c.port) == *key);
            let Some(existing) = existing else {
                if let Err(e) = self.backends.ipvs.add_real_server(vs, rs).await {
                    error!("failed to add real server {} to {}: {}", rs, vs, e);
                }
                continue;
            };
            if self.graceful.in_termination_list(&unique_rs_name(vs, rs)) {
                match self.graceful.rescue(vs, rs).await {
                    Ok(true) => {}
                    // Drained away between the listing and the rescue.
                    Ok(false) => {
                        let gone = self
                            .backends
                            .ipvs
                            .real_servers(vs)
                            .await
                            .map(|live| !live.iter().any(|l| l.same_destination(rs)))
                            .unwrap_or(false);
                        if gone && let Err(e) = self.backends.ipvs.add_real_server(vs, rs).await {
                            error!("failed to add real server {} to {}: {}", rs, vs, e);
                        }
                    }
                    Err(e) => error!("failed to restore real server {} of {}: {}", rs, vs, e),
                }
                continue;
            }
            if state.initial_sync && existing.weight != rs.weight {
                if let Err(e) = self.backends.ipvs.update_real_server(vs, rs).await {
                    error!("failed to reset weight of {} on {}: {}", rs, vs, e);
                }
            }
        }

        for rs in &current {
            if desired.contains_key(&(rs.address, rs.port)) {
                continue;
            }
            if self.graceful.in_termination_list(&unique_rs_name(vs, rs)) {
                continue;
            }
            if let Err(e) = self.graceful.graceful_delete_rs(vs, rs).await {
                error!("failed to delete real server {} of {}: {}", rs, vs, e);
            }
        }
        Ok(())
    }

    /// Close ports no longer needed and keep the rest for the next pass.
    fn commit_ports(&self, state: &mut ProxierState, plan: &mut SyncPlan) {
        let mut next = std::mem::take(&mut plan.new_ports);
        for (lp, mut socket) in state.port_map.drain() {
            if plan.kept_ports.contains(&lp) {
                next.insert(lp, socket);
            } else {
                info!("closing local port {}", lp);
                if let Err(e) = socket.close() {
                    error!("failed to close local port {}: {}", lp, e);
                }
            }
        }
        state.port_map = next;
    }

    /// Delete virtual servers and unbind addresses no longer wanted.
    async fn clean_legacy(
        &self,
        plan: &SyncPlan,
        installed: &HashMap<String, VirtualServer>,
        bound: &BTreeSet<String>,
    ) {
        let family = self.config.ip_family;
        for (key, vs) in installed {
            if plan.active_services.contains(key)
                || self.config.is_excluded(&vs.address)
                || !family.matches(&vs.address)
            {
                continue;
            }
            info!("deleting stale IPVS service {}", vs);
            match self.backends.ipvs.delete_virtual_server(vs).await {
                Ok(()) => self.graceful.forget_virtual_server(vs).await,
                Err(e) => error!("failed to delete IPVS service {}: {}", vs, e),
            }
        }

        for address in bound {
            if plan.active_bind_addrs.contains(address) {
                continue;
            }
            let Ok(ip) = address.parse::<IpAddr>() else {
                continue;
            };
            if !family.matches(&ip) || self.config.is_excluded(&ip) {
                continue;
            }
            info!("unbinding address {} from {}", address, self.config.dummy_device);
            if let Err(e) = self
                .backends
                .netlink
                .unbind_address(address, &self.config.dummy_device)
                .await
            {
                error!("failed to unbind {}: {}", address, e);
            }
        }
    }
}

impl SyncPlan {
    fn push(&mut self, desired: DesiredService) {
        self.active_services.insert(desired.vs.to_string());
        if desired.bind {
            self.active_bind_addrs.insert(desired.vs.address.to_string());
        }
        self.services.push(desired);
    }
}

/// NAT entries pointing at endpoints that went away, as `(origin, endpoint, protocol)`.
fn stale_nat_entries(
    service_map: &ServiceMap,
    stale: &[ServiceEndpoint],
) -> Vec<(String, String, Protocol)> {
    let mut entries = Vec::new();
    for pair in stale {
        let Some(svc) = service_map.get(&pair.service_port_name) else {
            continue;
        };
        if !svc.protocol.needs_conntrack_clear() {
            continue;
        }
        let Ok((endpoint_ip, _)) = split_host_port(&pair.endpoint) else {
            continue;
        };
        let origins = std::iter::once(svc.cluster_ip.to_string())
            .chain(svc.external_ips.iter().cloned())
            .chain(svc.load_balancer_ips.iter().cloned());
        for origin in origins {
            entries.push((origin, endpoint_ip.to_string(), svc.protocol));
        }
    }
    entries
}

fn insert_entry(sets: &mut BTreeMap<&'static str, ProxyIpSet>, set: &str, entry: &Entry) -> bool {
    match sets.get_mut(set) {
        Some(s) => s.insert(entry),
        None => false,
    }
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}
