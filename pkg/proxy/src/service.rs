use pkg_constants::proxy::{ANNOTATION_TOPOLOGY_AWARE_HINTS, DEFAULT_CLIENT_IP_AFFINITY_SECONDS};
use pkg_types::meta::{IpFamily, NamespacedName, Protocol};
use pkg_types::service::{Service, SessionAffinity, TrafficPolicy};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use tracing::{debug, error, warn};

use crate::config::ProxyFeatures;
use crate::lock;

/// Identity of one port of one service: `namespace/name:port` plus protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServicePortName {
    pub namespaced_name: NamespacedName,
    pub port: String,
    pub protocol: Protocol,
}

impl ServicePortName {
    pub fn new(namespaced_name: NamespacedName, port: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            namespaced_name,
            port: port.into(),
            protocol,
        }
    }
}

impl std::fmt::Display for ServicePortName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.port.is_empty() {
            write!(f, "{}", self.namespaced_name)
        } else {
            write!(f, "{}:{}", self.namespaced_name, self.port)
        }
    }
}

/// Dataplane view of one service port. Replaced, never mutated, on update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    pub cluster_ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    /// Zero when the service has no node port.
    pub node_port: u16,
    /// Sticky timeout in seconds when session affinity is `ClientIP`.
    pub session_affinity_seconds: Option<u32>,
    pub external_ips: Vec<String>,
    pub load_balancer_ips: Vec<String>,
    pub load_balancer_source_ranges: Vec<String>,
    /// Zero when no health check node port is needed.
    pub health_check_node_port: u16,
    pub node_local_external: bool,
    pub node_local_internal: bool,
    pub internal_traffic_policy: Option<TrafficPolicy>,
    /// Value of the topology-aware-hints annotation, empty when unset.
    pub hints_annotation: String,
    /// Free-form data attached by a [`MakeServicePortFn`].
    pub extension: BTreeMap<String, String>,
}

impl ServicePort {
    pub fn uses_client_ip_affinity(&self) -> bool {
        self.session_affinity_seconds.is_some()
    }
}

impl std::fmt::Display for ServicePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.cluster_ip {
            IpAddr::V6(ip) => write!(f, "[{}]:{}/{}", ip, self.port, self.protocol),
            IpAddr::V4(ip) => write!(f, "{}:{}/{}", ip, self.port, self.protocol),
        }
    }
}

/// All ports projected from one service.
pub type ServicePortMap = HashMap<ServicePortName, ServicePort>;

/// Rewrites or drops a projected port. Returning `None` drops it.
pub type MakeServicePortFn = Box<dyn Fn(&Service, ServicePort) -> Option<ServicePort> + Send + Sync>;

/// Called with `(previous, current)` for every change applied to a [`ServiceMap`].
pub type ServiceMapChangeFn =
    Box<dyn Fn(Option<&ServicePortMap>, Option<&ServicePortMap>) + Send + Sync>;

/// Pending change for one service. `None` means "did not exist".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceChange {
    pub previous: Option<ServicePortMap>,
    pub current: Option<ServicePortMap>,
}

/// Accumulates service changes between syncs.
pub struct ServiceChangeTracker {
    items: Mutex<HashMap<NamespacedName, ServiceChange>>,
    ip_family: IpFamily,
    features: ProxyFeatures,
    make_service_port: Option<MakeServicePortFn>,
    on_change: Option<ServiceMapChangeFn>,
}

impl ServiceChangeTracker {
    pub fn new(
        ip_family: IpFamily,
        features: ProxyFeatures,
        make_service_port: Option<MakeServicePortFn>,
        on_change: Option<ServiceMapChangeFn>,
    ) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            ip_family,
            features,
            make_service_port,
            on_change,
        }
    }

    /// Record a service add `(None, Some)`, update `(Some, Some)` or delete
    /// `(Some, None)`. Returns true while any change is pending.
    pub fn update(&self, previous: Option<&Service>, current: Option<&Service>) -> bool {
        let Some(svc) = current.or(previous) else {
            return false;
        };
        let name = svc.namespaced_name();

        let mut items = lock(&self.items);
        let previous_map = if items.contains_key(&name) {
            None
        } else {
            Some(self.service_to_port_map(previous))
        };
        let current_map = self.service_to_port_map(current);

        let change = items.entry(name.clone()).or_insert_with(|| ServiceChange {
            previous: previous_map.flatten(),
            current: None,
        });
        change.current = current_map;
        if change.previous == change.current {
            debug!("service {} change collapsed to no-op", name);
            items.remove(&name);
        }
        !items.is_empty()
    }

    /// Number of services with a pending change.
    pub fn pending(&self) -> usize {
        lock(&self.items).len()
    }

    /// Take every pending change, leaving the tracker empty.
    pub fn checkout_changes(&self) -> Vec<ServiceChange> {
        let items = std::mem::take(&mut *lock(&self.items));
        items.into_values().collect()
    }

    fn service_to_port_map(&self, svc: Option<&Service>) -> Option<ServicePortMap> {
        let svc = svc?;
        if svc.should_skip() {
            debug!("skipping service {}: headless or external name", svc.namespaced_name());
            return None;
        }
        let Some(cluster_ip) = svc
            .cluster_ip_for_family(self.ip_family)
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
        else {
            debug!(
                "skipping service {}: no {} cluster IP",
                svc.namespaced_name(),
                self.ip_family
            );
            return None;
        };

        let name = svc.namespaced_name();
        let mut ports = ServicePortMap::new();
        for port in &svc.spec.ports {
            if port.port == 0 {
                warn!("ignoring port {:?} of service {}: port is zero", port.name, name);
                continue;
            }
            let spn = ServicePortName::new(name.clone(), &port.name, port.protocol);
            let base = self.make_base_port(svc, cluster_ip, port);
            let projected = match &self.make_service_port {
                Some(make) => make(svc, base),
                None => Some(base),
            };
            if let Some(sp) = projected {
                ports.insert(spn, sp);
            }
        }
        Some(ports)
    }

    fn make_base_port(
        &self,
        svc: &Service,
        cluster_ip: IpAddr,
        port: &pkg_types::service::ServicePort,
    ) -> ServicePort {
        let name = svc.namespaced_name();
        let spec = &svc.spec;

        let session_affinity_seconds = match spec.session_affinity {
            SessionAffinity::ClientIP => Some(
                spec.session_affinity_timeout_seconds
                    .unwrap_or(DEFAULT_CLIENT_IP_AFFINITY_SECONDS),
            ),
            SessionAffinity::None => None,
        };

        let external_ips = self.filter_ips(&name, "external IP", spec.external_ips.iter());
        let load_balancer_ips = self.filter_ips(
            &name,
            "load balancer ingress IP",
            svc.status
                .load_balancer_ingress
                .iter()
                .map(|ing| &ing.ip)
                .filter(|ip| !ip.is_empty()),
        );

        let mut load_balancer_source_ranges = Vec::new();
        for range in &spec.load_balancer_source_ranges {
            let range = range.trim();
            match range.parse::<ipnetwork::IpNetwork>() {
                Ok(net) if self.ip_family.matches(&net.ip()) => {
                    load_balancer_source_ranges.push(range.to_string())
                }
                Ok(_) => debug!(
                    "service {}: source range {} is not {}",
                    name, range, self.ip_family
                ),
                Err(_) => warn!("service {}: invalid source range {:?}", name, range),
            }
        }

        let health_check_node_port = if svc.needs_health_check() {
            match spec.health_check_node_port {
                Some(p) if p != 0 => p,
                _ => {
                    error!("service {} has no health check node port", name);
                    0
                }
            }
        } else {
            0
        };

        ServicePort {
            cluster_ip,
            port: port.port,
            protocol: port.protocol,
            node_port: port.node_port.unwrap_or(0),
            session_affinity_seconds,
            external_ips,
            load_balancer_ips,
            load_balancer_source_ranges,
            health_check_node_port,
            node_local_external: svc.requests_only_local_traffic(),
            node_local_internal: self.features.internal_traffic_policy
                && svc.requests_only_local_traffic_for_internal(),
            internal_traffic_policy: spec.internal_traffic_policy,
            hints_annotation: svc
                .annotations
                .get(ANNOTATION_TOPOLOGY_AWARE_HINTS)
                .cloned()
                .unwrap_or_default(),
            extension: BTreeMap::new(),
        }
    }

    fn filter_ips<'a>(
        &self,
        name: &NamespacedName,
        kind: &str,
        ips: impl Iterator<Item = &'a String>,
    ) -> Vec<String> {
        let mut out = Vec::new();
        for ip in ips {
            let ip = ip.trim();
            match ip.parse::<IpAddr>() {
                Ok(addr) if self.ip_family.matches(&addr) => out.push(ip.to_string()),
                Ok(_) => debug!("service {}: {} {} is not {}", name, kind, ip, self.ip_family),
                Err(_) => warn!("service {}: invalid {} {:?}", name, kind, ip),
            }
        }
        out
    }
}

/// Outcome of folding pending service changes into a [`ServiceMap`].
#[derive(Debug, Clone, Default)]
pub struct UpdateServiceMapResult {
    /// Health check node port per service that needs one.
    pub hc_service_node_ports: HashMap<NamespacedName, u16>,
    /// Cluster IPs of removed UDP ports whose conntrack entries must go.
    pub udp_stale_cluster_ip: HashSet<String>,
}

/// Live set of service ports, owned by the proxier.
#[derive(Debug, Clone, Default)]
pub struct ServiceMap {
    ports: ServicePortMap,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every pending change from `tracker`.
    pub fn update(&mut self, tracker: &ServiceChangeTracker) -> UpdateServiceMapResult {
        let mut result = UpdateServiceMapResult::default();
        for change in tracker.checkout_changes() {
            if let Some(observer) = &tracker.on_change {
                observer(change.previous.as_ref(), change.current.as_ref());
            }
            self.unmerge(
                change.previous.as_ref(),
                change.current.as_ref(),
                &mut result.udp_stale_cluster_ip,
            );
            self.merge(change.current);
        }

        for (spn, sp) in &self.ports {
            if sp.health_check_node_port != 0 {
                result
                    .hc_service_node_ports
                    .insert(spn.namespaced_name.clone(), sp.health_check_node_port);
            }
        }
        result
    }

    fn merge(&mut self, current: Option<ServicePortMap>) {
        if let Some(current) = current {
            self.ports.extend(current);
        }
    }

    fn unmerge(
        &mut self,
        previous: Option<&ServicePortMap>,
        current: Option<&ServicePortMap>,
        udp_stale_cluster_ip: &mut HashSet<String>,
    ) {
        let Some(previous) = previous else {
            return;
        };
        for spn in previous.keys() {
            let Some(removed) = self.ports.remove(spn) else {
                continue;
            };
            let still_present = current.is_some_and(|c| c.contains_key(spn));
            if !still_present && removed.protocol == Protocol::Udp {
                udp_stale_cluster_ip.insert(removed.cluster_ip.to_string());
            }
        }
    }

    pub fn get(&self, spn: &ServicePortName) -> Option<&ServicePort> {
        self.ports.get(spn)
    }

    pub fn contains(&self, spn: &ServicePortName) -> bool {
        self.ports.contains_key(spn)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServicePortName, &ServicePort)> {
        self.ports.iter()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pkg_types::service::{LoadBalancerIngress, ServiceSpec, ServiceStatus, ServiceType};

    pub(crate) fn make_service(ns: &str, name: &str, cluster_ip: &str, ports: &[(&str, u16, Protocol)]) -> Service {
        Service {
            name: name.to_string(),
            namespace: ns.to_string(),
            annotations: HashMap::new(),
            spec: ServiceSpec {
                ports: ports
                    .iter()
                    .map(|(n, p, proto)| pkg_types::service::ServicePort {
                        name: n.to_string(),
                        protocol: *proto,
                        port: *p,
                        target_port: *p,
                        node_port: None,
                    })
                    .collect(),
                cluster_ip: Some(cluster_ip.to_string()),
                ..Default::default()
            },
            status: ServiceStatus::default(),
            created_at: chrono::Utc::now(),
        }
    }

    fn make_tracker() -> ServiceChangeTracker {
        ServiceChangeTracker::new(IpFamily::IPv4, ProxyFeatures::default(), None, None)
    }

    fn spn(ns: &str, name: &str, port: &str, proto: Protocol) -> ServicePortName {
        ServicePortName::new(NamespacedName::new(ns, name), port, proto)
    }

    #[test]
    fn port_name_display() {
        assert_eq!(spn("ns", "svc", "http", Protocol::Tcp).to_string(), "ns/svc:http");
        assert_eq!(spn("ns", "svc", "", Protocol::Tcp).to_string(), "ns/svc");
    }

    #[test]
    fn add_then_delete_collapses() {
        let tracker = make_tracker();
        let svc = make_service("ns", "svc", "10.0.0.5", &[("http", 80, Protocol::Tcp)]);
        assert!(tracker.update(None, Some(&svc)));
        assert!(!tracker.update(Some(&svc), None));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn none_none_is_ignored() {
        let tracker = make_tracker();
        assert!(!tracker.update(None, None));
    }

    #[test]
    fn headless_and_external_name_are_skipped() {
        let tracker = make_tracker();
        let mut headless = make_service("ns", "db", "None", &[("pg", 5432, Protocol::Tcp)]);
        headless.spec.cluster_ip = Some("None".to_string());
        assert!(!tracker.update(None, Some(&headless)));

        let mut ext = make_service("ns", "ext", "10.0.0.9", &[("http", 80, Protocol::Tcp)]);
        ext.spec.service_type = ServiceType::ExternalName;
        assert!(!tracker.update(None, Some(&ext)));
    }

    #[test]
    fn projection_filters_by_family() {
        let tracker = make_tracker();
        let mut svc = make_service("ns", "lb", "10.0.0.5", &[("http", 80, Protocol::Tcp)]);
        svc.spec.service_type = ServiceType::LoadBalancer;
        svc.spec.external_traffic_policy = TrafficPolicy::Local;
        svc.spec.health_check_node_port = Some(30999);
        svc.spec.external_ips = vec!["1.2.3.4".into(), "fd00::1".into(), "bogus".into()];
        svc.spec.load_balancer_source_ranges = vec![" 192.168.0.0/16 ".into(), "fd00::/64".into()];
        svc.spec.session_affinity = SessionAffinity::ClientIP;
        svc.status.load_balancer_ingress = vec![
            LoadBalancerIngress { ip: "5.6.7.8".into(), hostname: None },
            LoadBalancerIngress { ip: String::new(), hostname: Some("lb.example".into()) },
        ];
        tracker.update(None, Some(&svc));

        let mut map = ServiceMap::new();
        let result = map.update(&tracker);
        let sp = map.get(&spn("ns", "lb", "http", Protocol::Tcp)).unwrap();
        assert_eq!(sp.external_ips, vec!["1.2.3.4".to_string()]);
        assert_eq!(sp.load_balancer_ips, vec!["5.6.7.8".to_string()]);
        assert_eq!(sp.load_balancer_source_ranges, vec!["192.168.0.0/16".to_string()]);
        assert_eq!(sp.session_affinity_seconds, Some(DEFAULT_CLIENT_IP_AFFINITY_SECONDS));
        assert!(sp.node_local_external);
        assert_eq!(sp.health_check_node_port, 30999);
        assert_eq!(
            result.hc_service_node_ports.get(&NamespacedName::new("ns", "lb")),
            Some(&30999)
        );
    }

    #[test]
    fn removed_udp_port_is_stale() {
        let tracker = make_tracker();
        let mut map = ServiceMap::new();
        let v1 = make_service(
            "kube-system",
            "dns",
            "10.0.0.10",
            &[("dns", 53, Protocol::Udp), ("dns-tcp", 53, Protocol::Tcp)],
        );
        tracker.update(None, Some(&v1));
        map.update(&tracker);
        assert_eq!(map.len(), 2);

        let v2 = make_service("kube-system", "dns", "10.0.0.10", &[("dns-tcp", 53, Protocol::Tcp)]);
        tracker.update(Some(&v1), Some(&v2));
        let result = map.update(&tracker);
        assert_eq!(map.len(), 1);
        assert!(result.udp_stale_cluster_ip.contains("10.0.0.10"));
    }

    #[test]
    fn updated_udp_port_is_not_stale() {
        let tracker = make_tracker();
        let mut map = ServiceMap::new();
        let v1 = make_service("ns", "svc", "10.0.0.10", &[("dns", 53, Protocol::Udp)]);
        tracker.update(None, Some(&v1));
        map.update(&tracker);

        let mut v2 = v1.clone();
        v2.spec.external_ips = vec!["1.2.3.4".into()];
        tracker.update(Some(&v1), Some(&v2));
        let result = map.update(&tracker);
        assert!(result.udp_stale_cluster_ip.is_empty());
        assert_eq!(
            map.get(&spn("ns", "svc", "dns", Protocol::Udp)).unwrap().external_ips,
            vec!["1.2.3.4".to_string()]
        );
    }

    #[test]
    fn factory_can_drop_and_observer_sees_changes() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let tracker = ServiceChangeTracker::new(
            IpFamily::IPv4,
            ProxyFeatures::default(),
            Some(Box::new(|_svc, sp| (sp.port != 8443).then_some(sp))),
            Some(Box::new(move |_prev, _cur| {
                seen2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let svc = make_service(
            "ns",
            "svc",
            "10.0.0.5",
            &[("http", 80, Protocol::Tcp), ("https", 8443, Protocol::Tcp)],
        );
        tracker.update(None, Some(&svc));
        let mut map = ServiceMap::new();
        map.update(&tracker);
        assert_eq!(map.len(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
