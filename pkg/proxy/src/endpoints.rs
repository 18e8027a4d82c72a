use chrono::{DateTime, Utc};
use pkg_constants::proxy::ANNOTATION_LAST_CHANGE_TRIGGER_TIME;
use pkg_types::endpoint::{EndpointSlice, Endpoints};
use pkg_types::meta::{IpFamily, NamespacedName};
use pkg_types::validate::{join_host_port, split_host_port};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::endpointslice_cache::EndpointSliceCache;
use crate::lock;
use crate::service::ServicePortName;

/// One backend of a service port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// `ip:port`, IPv6 hosts in brackets.
    pub endpoint: String,
    pub is_local: bool,
    pub ready: bool,
    pub serving: bool,
    pub terminating: bool,
    pub node_name: String,
    pub zone: String,
    pub zone_hints: BTreeSet<String>,
}

impl Endpoint {
    pub fn new(ip: &str, port: u16) -> Self {
        Self {
            endpoint: join_host_port(ip, port),
            ..Default::default()
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        split_host_port(&self.endpoint).ok().map(|(ip, _)| ip)
    }

    pub fn port(&self) -> Option<u16> {
        split_host_port(&self.endpoint).ok().map(|(_, port)| port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.endpoint)
    }
}

/// An endpoint paired with the service port it backs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceEndpoint {
    pub endpoint: String,
    pub service_port_name: ServicePortName,
}

/// Endpoints of every port of one service.
pub type EndpointsPortMap = HashMap<ServicePortName, Vec<Endpoint>>;

/// Rewrites or drops a projected endpoint. Returning `None` drops it.
pub type MakeEndpointFn = Box<dyn Fn(Endpoint, &ServicePortName) -> Option<Endpoint> + Send + Sync>;

/// Called with `(previous, current)` for every change applied to an [`EndpointsMap`].
pub type EndpointsMapChangeFn =
    Box<dyn Fn(Option<&EndpointsPortMap>, Option<&EndpointsPortMap>) + Send + Sync>;

/// Pending change for one service's endpoints. `None` means "did not exist".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointsChange {
    pub previous: Option<EndpointsPortMap>,
    pub current: Option<EndpointsPortMap>,
}

#[derive(Default)]
struct TrackerState {
    items: HashMap<NamespacedName, EndpointsChange>,
    last_change_trigger_times: HashMap<NamespacedName, Vec<DateTime<Utc>>>,
}

/// Accumulates endpoint changes, from either `Endpoints` objects or
/// `EndpointSlice`s, between syncs.
pub struct EndpointChangeTracker {
    hostname: String,
    ip_family: IpFamily,
    state: Mutex<TrackerState>,
    slice_cache: EndpointSliceCache,
    tracker_start_time: DateTime<Utc>,
    make_endpoint: Option<MakeEndpointFn>,
    on_change: Option<EndpointsMapChangeFn>,
}

impl EndpointChangeTracker {
    pub fn new(
        hostname: impl Into<String>,
        ip_family: IpFamily,
        make_endpoint: Option<MakeEndpointFn>,
        on_change: Option<EndpointsMapChangeFn>,
    ) -> Self {
        let hostname = hostname.into();
        Self {
            slice_cache: EndpointSliceCache::new(hostname.clone(), ip_family),
            hostname,
            ip_family,
            state: Mutex::new(TrackerState::default()),
            tracker_start_time: Utc::now(),
            make_endpoint,
            on_change,
        }
    }

    /// Record an `Endpoints` add, update or delete. Returns true while any
    /// change is pending.
    pub fn update(&self, previous: Option<&Endpoints>, current: Option<&Endpoints>) -> bool {
        let Some(eps) = current.or(previous) else {
            return false;
        };
        let name = eps.namespaced_name();

        let mut state = lock(&self.state);
        let baseline = if state.items.contains_key(&name) {
            None
        } else {
            Some(self.endpoints_to_port_map(previous))
        };
        let current_map = self.endpoints_to_port_map(current);

        let change = state.items.entry(name.clone()).or_insert_with(|| EndpointsChange {
            previous: baseline.flatten(),
            current: None,
        });
        change.current = current_map;

        if let Some(t) = current.and_then(|c| self.trigger_time(&c.annotations)) {
            state
                .last_change_trigger_times
                .entry(name.clone())
                .or_default()
                .push(t);
        }

        let collapsed = state
            .items
            .get(&name)
            .is_some_and(|c| c.previous == c.current);
        if collapsed {
            debug!("endpoints {} change collapsed to no-op", name);
            state.items.remove(&name);
            state.last_change_trigger_times.remove(&name);
        }
        !state.items.is_empty()
    }

    /// Record an `EndpointSlice` change. `remove` marks a deletion. Returns
    /// true if the slice differs from what the cache already holds.
    pub fn endpoint_slice_update(&self, slice: &EndpointSlice, remove: bool) -> bool {
        if slice.service_name().is_none() {
            warn!(
                "ignoring endpoint slice {}/{}: missing service name label",
                slice.namespace, slice.name
            );
            return false;
        }
        if !self.slice_cache.supports_address_type(slice) {
            debug!(
                "ignoring endpoint slice {}/{}: unsupported address type {:?}",
                slice.namespace, slice.name, slice.address_type
            );
            return false;
        }

        let changed = self.slice_cache.update_pending(slice, remove);
        if changed && !remove {
            if let (Some(t), Some(svc)) = (self.trigger_time(&slice.annotations), slice.service_name()) {
                lock(&self.state)
                    .last_change_trigger_times
                    .entry(NamespacedName::new(&slice.namespace, svc))
                    .or_default()
                    .push(t);
            }
        }
        changed
    }

    /// Number of services with a pending change.
    pub fn pending(&self) -> usize {
        lock(&self.state).items.len() + self.slice_cache.pending()
    }

    /// Take every pending change from both sources.
    pub fn checkout_changes(&self) -> Vec<EndpointsChange> {
        let mut changes: Vec<EndpointsChange> =
            std::mem::take(&mut lock(&self.state).items).into_values().collect();
        changes.extend(
            self.slice_cache
                .checkout_changes(self.make_endpoint.as_ref())
                .into_values(),
        );
        changes
    }

    /// Take the trigger times recorded since the last checkout.
    pub fn checkout_trigger_times(&self) -> HashMap<NamespacedName, Vec<DateTime<Utc>>> {
        std::mem::take(&mut lock(&self.state).last_change_trigger_times)
    }

    fn trigger_time(&self, annotations: &HashMap<String, String>) -> Option<DateTime<Utc>> {
        let raw = annotations.get(ANNOTATION_LAST_CHANGE_TRIGGER_TIME)?;
        match DateTime::parse_from_rfc3339(raw) {
            Ok(t) => {
                let t = t.with_timezone(&Utc);
                // Objects synced on startup carry times from before this process.
                (t > self.tracker_start_time).then_some(t)
            }
            Err(e) => {
                warn!("invalid last change trigger time {:?}: {}", raw, e);
                None
            }
        }
    }

    fn endpoints_to_port_map(&self, eps: Option<&Endpoints>) -> Option<EndpointsPortMap> {
        let eps = eps?;
        let name = eps.namespaced_name();
        let mut map = EndpointsPortMap::new();

        for subset in &eps.subsets {
            for port in &subset.ports {
                if port.port == 0 {
                    warn!("ignoring invalid endpoint port {:?} of {}", port.name, name);
                    continue;
                }
                let spn = ServicePortName::new(name.clone(), &port.name, port.protocol);
                let list = map.entry(spn.clone()).or_insert_with(Vec::new);
                for addr in &subset.addresses {
                    let ip = addr.ip.trim();
                    if ip.is_empty() {
                        warn!("ignoring endpoint of {} with empty host", spn);
                        continue;
                    }
                    if !self.ip_family.matches_str(ip) {
                        debug!("ignoring endpoint {} of {}: not {}", ip, spn, self.ip_family);
                        continue;
                    }
                    let node_name = addr.node_name.clone().unwrap_or_default();
                    let ep = Endpoint {
                        endpoint: join_host_port(ip, port.port),
                        is_local: !node_name.is_empty() && node_name == self.hostname,
                        ready: true,
                        serving: true,
                        terminating: false,
                        node_name,
                        ..Default::default()
                    };
                    let ep = match &self.make_endpoint {
                        Some(make) => match make(ep, &spn) {
                            Some(ep) => ep,
                            None => continue,
                        },
                        None => ep,
                    };
                    if !list.iter().any(|e| e.endpoint == ep.endpoint) {
                        list.push(ep);
                    }
                }
                if list.is_empty() {
                    map.remove(&spn);
                }
            }
        }
        Some(map)
    }
}

/// Outcome of folding pending endpoint changes into an [`EndpointsMap`].
#[derive(Debug, Clone, Default)]
pub struct UpdateEndpointMapResult {
    /// Distinct IPs of local ready endpoints per service.
    pub hc_endpoints_local_ip_size: HashMap<NamespacedName, usize>,
    /// UDP/SCTP endpoints that went away and whose conntrack entries must go.
    pub stale_endpoints: Vec<ServiceEndpoint>,
    /// UDP/SCTP service ports that went from zero to some ready endpoints.
    pub stale_service_names: Vec<ServicePortName>,
    pub last_change_trigger_times: HashMap<NamespacedName, Vec<DateTime<Utc>>>,
}

/// Live endpoints per service port, owned by the proxier.
#[derive(Debug, Clone, Default)]
pub struct EndpointsMap {
    endpoints: EndpointsPortMap,
}

impl EndpointsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every pending change from `tracker`.
    pub fn update(&mut self, tracker: &EndpointChangeTracker) -> UpdateEndpointMapResult {
        let mut result = UpdateEndpointMapResult::default();
        for change in tracker.checkout_changes() {
            if let Some(observer) = &tracker.on_change {
                observer(change.previous.as_ref(), change.current.as_ref());
            }
            self.unmerge(change.previous.as_ref());
            self.merge(change.current.as_ref());
            detect_stale_connections(
                change.previous.as_ref(),
                change.current.as_ref(),
                &mut result.stale_endpoints,
                &mut result.stale_service_names,
            );
        }
        result.last_change_trigger_times = tracker.checkout_trigger_times();
        result.hc_endpoints_local_ip_size = self.local_ready_endpoint_ips();
        result
    }

    fn merge(&mut self, current: Option<&EndpointsPortMap>) {
        if let Some(current) = current {
            for (spn, eps) in current {
                self.endpoints.insert(spn.clone(), eps.clone());
            }
        }
    }

    fn unmerge(&mut self, previous: Option<&EndpointsPortMap>) {
        if let Some(previous) = previous {
            for spn in previous.keys() {
                self.endpoints.remove(spn);
            }
        }
    }

    fn local_ready_endpoint_ips(&self) -> HashMap<NamespacedName, usize> {
        let mut ips: HashMap<NamespacedName, HashSet<String>> = HashMap::new();
        for (spn, eps) in &self.endpoints {
            for ep in eps.iter().filter(|e| e.is_local && e.ready) {
                if let Some(ip) = ep.ip() {
                    ips.entry(spn.namespaced_name.clone())
                        .or_default()
                        .insert(ip.to_string());
                }
            }
        }
        ips.into_iter().map(|(k, v)| (k, v.len())).collect()
    }

    pub fn get(&self, spn: &ServicePortName) -> Option<&Vec<Endpoint>> {
        self.endpoints.get(spn)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServicePortName, &Vec<Endpoint>)> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

fn detect_stale_connections(
    previous: Option<&EndpointsPortMap>,
    current: Option<&EndpointsPortMap>,
    stale_endpoints: &mut Vec<ServiceEndpoint>,
    stale_service_names: &mut Vec<ServicePortName>,
) {
    let empty = EndpointsPortMap::new();
    let previous = previous.unwrap_or(&empty);
    let current = current.unwrap_or(&empty);

    for (spn, eps) in previous {
        if !spn.protocol.needs_conntrack_clear() {
            continue;
        }
        let new_eps = current.get(spn);
        for ep in eps.iter().filter(|e| e.ready) {
            let still_there = new_eps.is_some_and(|list| list.iter().any(|n| n == ep));
            if !still_there {
                debug!("stale {} endpoint {} of {}", spn.protocol, ep, spn);
                stale_endpoints.push(ServiceEndpoint {
                    endpoint: ep.endpoint.clone(),
                    service_port_name: spn.clone(),
                });
            }
        }
    }

    for (spn, eps) in current {
        if !spn.protocol.needs_conntrack_clear() {
            continue;
        }
        let ready = eps.iter().filter(|e| e.ready).count();
        let old_ready = previous
            .get(spn)
            .map(|list| list.iter().filter(|e| e.ready).count())
            .unwrap_or(0);
        if ready > 0 && old_ready == 0 {
            stale_service_names.push(spn.clone());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pkg_types::endpoint::{EndpointAddress, EndpointPort, EndpointSubset};
    use pkg_types::meta::Protocol;

    pub(crate) fn make_endpoints(
        ns: &str,
        name: &str,
        port: (&str, u16, Protocol),
        addrs: &[(&str, &str)],
    ) -> Endpoints {
        Endpoints {
            name: name.to_string(),
            namespace: ns.to_string(),
            annotations: HashMap::new(),
            subsets: vec![EndpointSubset {
                addresses: addrs
                    .iter()
                    .map(|(ip, node)| EndpointAddress {
                        ip: ip.to_string(),
                        node_name: Some(node.to_string()),
                        hostname: None,
                    })
                    .collect(),
                not_ready_addresses: vec![],
                ports: vec![EndpointPort {
                    name: port.0.to_string(),
                    port: port.1,
                    protocol: port.2,
                }],
            }],
        }
    }

    fn make_tracker() -> EndpointChangeTracker {
        EndpointChangeTracker::new("node-a", IpFamily::IPv4, None, None)
    }

    fn spn(ns: &str, name: &str, port: &str, proto: Protocol) -> ServicePortName {
        ServicePortName::new(NamespacedName::new(ns, name), port, proto)
    }

    #[test]
    fn update_then_revert_is_noop() {
        let tracker = make_tracker();
        let e1 = make_endpoints("ns", "svc", ("http", 8080, Protocol::Tcp), &[("10.1.1.1", "node-a")]);
        let e2 = make_endpoints("ns", "svc", ("http", 8080, Protocol::Tcp), &[("10.1.1.2", "node-b")]);
        assert!(tracker.update(Some(&e1), Some(&e2)));
        assert!(!tracker.update(Some(&e2), Some(&e1)));
        assert!(tracker.checkout_changes().is_empty());
    }

    #[test]
    fn projection_drops_malformed_items() {
        let tracker = make_tracker();
        let mut eps = make_endpoints(
            "ns",
            "svc",
            ("http", 8080, Protocol::Tcp),
            &[("10.1.1.1", "node-a"), ("", "node-a"), ("fd00::1", "node-a"), ("10.1.1.1", "node-a")],
        );
        eps.subsets[0].ports.push(EndpointPort {
            name: "zero".into(),
            port: 0,
            protocol: Protocol::Tcp,
        });
        tracker.update(None, Some(&eps));

        let mut map = EndpointsMap::new();
        map.update(&tracker);
        let list = map.get(&spn("ns", "svc", "http", Protocol::Tcp)).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].endpoint, "10.1.1.1:8080");
        assert!(list[0].is_local && list[0].ready && list[0].serving && !list[0].terminating);
        assert!(map.get(&spn("ns", "svc", "zero", Protocol::Tcp)).is_none());
    }

    #[test]
    fn merge_and_unmerge_replace_whole_service() {
        let tracker = make_tracker();
        let mut map = EndpointsMap::new();
        let e1 = make_endpoints("ns", "svc", ("http", 8080, Protocol::Tcp), &[("10.1.1.1", "node-a")]);
        tracker.update(None, Some(&e1));
        map.update(&tracker);

        let e2 = make_endpoints("ns", "svc", ("web", 8080, Protocol::Tcp), &[("10.1.1.1", "node-a")]);
        tracker.update(Some(&e1), Some(&e2));
        map.update(&tracker);
        assert!(map.get(&spn("ns", "svc", "http", Protocol::Tcp)).is_none());
        assert!(map.get(&spn("ns", "svc", "web", Protocol::Tcp)).is_some());

        tracker.update(Some(&e2), None);
        let result = map.update(&tracker);
        assert!(map.is_empty());
        assert!(result.hc_endpoints_local_ip_size.is_empty());
    }

    #[test]
    fn stale_udp_endpoint_and_service() {
        let tracker = make_tracker();
        let mut map = EndpointsMap::new();
        let dns = ("dns", 53, Protocol::Udp);

        let e1 = make_endpoints("kube-system", "dns", dns, &[("10.1.1.1", "node-a")]);
        tracker.update(None, Some(&e1));
        let result = map.update(&tracker);
        assert_eq!(result.stale_service_names, vec![spn("kube-system", "dns", "dns", Protocol::Udp)]);
        assert!(result.stale_endpoints.is_empty());

        let e2 = make_endpoints("kube-system", "dns", dns, &[("10.1.1.2", "node-b")]);
        tracker.update(Some(&e1), Some(&e2));
        let result = map.update(&tracker);
        assert_eq!(result.stale_endpoints.len(), 1);
        assert_eq!(result.stale_endpoints[0].endpoint, "10.1.1.1:53");
        assert!(result.stale_service_names.is_empty());
    }

    #[test]
    fn sctp_changes_are_stale_like_udp() {
        let tracker = make_tracker();
        let mut map = EndpointsMap::new();
        let diameter = ("diameter", 3868, Protocol::Sctp);
        let e1 = make_endpoints("ns", "aaa", diameter, &[("10.1.1.1", "node-a")]);
        tracker.update(None, Some(&e1));
        let result = map.update(&tracker);
        assert_eq!(result.stale_service_names, vec![spn("ns", "aaa", "diameter", Protocol::Sctp)]);

        tracker.update(Some(&e1), None);
        let result = map.update(&tracker);
        assert_eq!(result.stale_endpoints.len(), 1);
        assert_eq!(result.stale_endpoints[0].endpoint, "10.1.1.1:3868");
    }

    #[test]
    fn tcp_changes_are_never_stale() {
        let tracker = make_tracker();
        let mut map = EndpointsMap::new();
        let web = ("http", 80, Protocol::Tcp);
        let e1 = make_endpoints("ns", "web", web, &[("10.1.1.1", "node-a")]);
        tracker.update(None, Some(&e1));
        map.update(&tracker);
        tracker.update(Some(&e1), None);
        let result = map.update(&tracker);
        assert!(result.stale_endpoints.is_empty());
        assert!(result.stale_service_names.is_empty());
    }

    #[test]
    fn local_ip_size_counts_distinct_ips() {
        let tracker = make_tracker();
        let mut map = EndpointsMap::new();
        let mut eps = make_endpoints(
            "ns",
            "svc",
            ("http", 8080, Protocol::Tcp),
            &[("10.1.1.1", "node-a"), ("10.1.1.2", "node-a"), ("10.1.1.3", "node-b")],
        );
        eps.subsets[0].ports.push(EndpointPort {
            name: "metrics".into(),
            port: 9090,
            protocol: Protocol::Tcp,
        });
        tracker.update(None, Some(&eps));
        let result = map.update(&tracker);
        assert_eq!(
            result.hc_endpoints_local_ip_size.get(&NamespacedName::new("ns", "svc")),
            Some(&2)
        );
    }

    #[test]
    fn trigger_times_after_start_are_recorded() {
        let tracker = make_tracker();
        let mut eps = make_endpoints("ns", "svc", ("http", 80, Protocol::Tcp), &[("10.1.1.1", "node-a")]);
        let later = (Utc::now() + chrono::Duration::seconds(5)).to_rfc3339();
        eps.annotations
            .insert(ANNOTATION_LAST_CHANGE_TRIGGER_TIME.to_string(), later);
        tracker.update(None, Some(&eps));

        let mut old = eps.clone();
        old.name = "old".into();
        old.annotations.insert(
            ANNOTATION_LAST_CHANGE_TRIGGER_TIME.to_string(),
            "2020-01-01T00:00:00Z".to_string(),
        );
        tracker.update(None, Some(&old));

        let mut map = EndpointsMap::new();
        let result = map.update(&tracker);
        assert_eq!(result.last_change_trigger_times.len(), 1);
        assert!(
            result
                .last_change_trigger_times
                .contains_key(&NamespacedName::new("ns", "svc"))
        );
    }
}
