use pkg_types::endpoint::{AddressType, EndpointSlice, SliceEndpoint, SlicePort};
use pkg_types::meta::{IpFamily, NamespacedName};
use pkg_types::validate::join_host_port;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::endpoints::{Endpoint, EndpointsChange, EndpointsPortMap, MakeEndpointFn};
use crate::lock;
use crate::service::ServicePortName;

/// The parts of a slice that affect the dataplane, in a canonical order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SliceInfo {
    ports: Vec<SlicePort>,
    endpoints: Vec<SliceEndpoint>,
    remove: bool,
}

impl SliceInfo {
    fn new(slice: &EndpointSlice, remove: bool) -> Self {
        let mut ports = slice.ports.clone();
        ports.sort_by(|a, b| a.name.cmp(&b.name).then(a.port.cmp(&b.port)));
        let mut endpoints = slice.endpoints.clone();
        endpoints.sort_by(|a, b| a.addresses.cmp(&b.addresses));
        Self {
            ports,
            endpoints,
            remove,
        }
    }
}

/// Applied and pending slices of one service, keyed by slice name.
#[derive(Debug, Default)]
struct ServiceSlices {
    applied: HashMap<String, SliceInfo>,
    pending: HashMap<String, SliceInfo>,
}

impl ServiceSlices {
    fn has_changed(&self, slice_name: &str, info: &SliceInfo) -> bool {
        if let Some(pending) = self.pending.get(slice_name) {
            return pending != info;
        }
        if let Some(applied) = self.applied.get(slice_name) {
            return applied != info;
        }
        // Removing a slice we never saw changes nothing.
        !info.remove
    }
}

/// Folds the many slices of a service into one endpoints view.
pub struct EndpointSliceCache {
    hostname: String,
    ip_family: IpFamily,
    services: Mutex<HashMap<NamespacedName, ServiceSlices>>,
}

impl EndpointSliceCache {
    pub fn new(hostname: impl Into<String>, ip_family: IpFamily) -> Self {
        Self {
            hostname: hostname.into(),
            ip_family,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Only slices of this cache's IP family are tracked. FQDN slices never are.
    pub fn supports_address_type(&self, slice: &EndpointSlice) -> bool {
        matches!(
            (slice.address_type, self.ip_family),
            (AddressType::IPv4, IpFamily::IPv4) | (AddressType::IPv6, IpFamily::IPv6)
        )
    }

    /// Stage a slice add/update (`remove == false`) or delete. Returns true
    /// if the slice differs from the pending or applied copy.
    pub fn update_pending(&self, slice: &EndpointSlice, remove: bool) -> bool {
        let Some(svc) = slice.service_name() else {
            return false;
        };
        let key = NamespacedName::new(&slice.namespace, svc);
        let info = SliceInfo::new(slice, remove);

        let mut services = lock(&self.services);
        let tracker = services.entry(key).or_default();
        let changed = tracker.has_changed(&slice.name, &info);
        if changed {
            tracker.pending.insert(slice.name.clone(), info);
        }
        changed
    }

    /// Number of services with staged slices.
    pub fn pending(&self) -> usize {
        lock(&self.services)
            .values()
            .filter(|t| !t.pending.is_empty())
            .count()
    }

    /// Promote staged slices to applied and return the resulting endpoint
    /// changes per service. Changes that project to the same endpoints are
    /// dropped.
    pub fn checkout_changes(
        &self,
        make_endpoint: Option<&MakeEndpointFn>,
    ) -> HashMap<NamespacedName, EndpointsChange> {
        let mut changes = HashMap::new();
        let mut services = lock(&self.services);

        for (svc, tracker) in services.iter_mut() {
            if tracker.pending.is_empty() {
                continue;
            }
            let previous = self.project(svc, &tracker.applied, make_endpoint);
            for (name, info) in tracker.pending.drain() {
                if info.remove {
                    tracker.applied.remove(&name);
                } else {
                    tracker.applied.insert(name, info);
                }
            }
            let current = self.project(svc, &tracker.applied, make_endpoint);
            if previous != current {
                changes.insert(svc.clone(), EndpointsChange { previous, current });
            }
        }
        services.retain(|_, t| !t.applied.is_empty() || !t.pending.is_empty());
        changes
    }

    fn project(
        &self,
        svc: &NamespacedName,
        slices: &HashMap<String, SliceInfo>,
        make_endpoint: Option<&MakeEndpointFn>,
    ) -> Option<EndpointsPortMap> {
        let mut by_port: HashMap<ServicePortName, BTreeMap<String, Endpoint>> = HashMap::new();

        let mut names: Vec<&String> = slices.keys().collect();
        names.sort();
        for name in names {
            let info = &slices[name];
            for port in &info.ports {
                let (Some(port_name), Some(port_num), Some(protocol)) =
                    (port.name.as_ref(), port.port, port.protocol)
                else {
                    warn!("ignoring incomplete port {:?} in endpoint slice {}", port, name);
                    continue;
                };
                if port_num == 0 {
                    warn!("ignoring zero port {:?} in endpoint slice {}", port_name, name);
                    continue;
                }
                let spn = ServicePortName::new(svc.clone(), port_name, protocol);
                let entry = by_port.entry(spn.clone()).or_default();
                for ep in &info.endpoints {
                    if let Some(ep) = self.make_endpoint(ep, port_num, &spn, make_endpoint) {
                        entry.insert(ep.endpoint.clone(), ep);
                    }
                }
            }
        }

        let map: EndpointsPortMap = by_port
            .into_iter()
            .filter(|(_, eps)| !eps.is_empty())
            .map(|(spn, eps)| (spn, eps.into_values().collect()))
            .collect();
        (!map.is_empty()).then_some(map)
    }

    fn make_endpoint(
        &self,
        ep: &SliceEndpoint,
        port: u16,
        spn: &ServicePortName,
        make_endpoint: Option<&MakeEndpointFn>,
    ) -> Option<Endpoint> {
        let Some(addr) = ep.addresses.first().map(|a| a.trim()) else {
            warn!("ignoring endpoint without addresses for {}", spn);
            return None;
        };
        if addr.is_empty() {
            warn!("ignoring endpoint with empty host for {}", spn);
            return None;
        }
        if !self.ip_family.matches_str(addr) {
            debug!("ignoring endpoint {} of {}: not {}", addr, spn, self.ip_family);
            return None;
        }

        let ready = ep.conditions.ready.unwrap_or(true);
        let node_name = ep.node_name.clone().unwrap_or_default();
        let endpoint = Endpoint {
            endpoint: join_host_port(addr, port),
            is_local: !node_name.is_empty() && node_name == self.hostname,
            ready,
            serving: ep.conditions.serving.unwrap_or(ready),
            terminating: ep.conditions.terminating.unwrap_or(false),
            node_name,
            zone: ep.zone.clone().unwrap_or_default(),
            zone_hints: ep
                .hints
                .as_ref()
                .map(|h| h.for_zones.iter().cloned().collect())
                .unwrap_or_default(),
        };
        match make_endpoint {
            Some(make) => make(endpoint, spn),
            None => Some(endpoint),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pkg_constants::proxy::LABEL_SERVICE_NAME;
    use pkg_types::endpoint::{EndpointConditions, EndpointHints};
    use pkg_types::meta::Protocol;

    pub(crate) fn make_slice_endpoint(ip: &str, node: &str, ready: bool) -> SliceEndpoint {
        SliceEndpoint {
            addresses: vec![ip.to_string()],
            conditions: EndpointConditions {
                ready: Some(ready),
                serving: None,
                terminating: None,
            },
            node_name: Some(node.to_string()),
            zone: None,
            hints: None,
        }
    }

    pub(crate) fn make_slice(
        ns: &str,
        svc: &str,
        slice_name: &str,
        port: (&str, u16, Protocol),
        endpoints: Vec<SliceEndpoint>,
    ) -> EndpointSlice {
        EndpointSlice {
            name: slice_name.to_string(),
            namespace: ns.to_string(),
            labels: HashMap::from([(LABEL_SERVICE_NAME.to_string(), svc.to_string())]),
            annotations: HashMap::new(),
            address_type: AddressType::IPv4,
            endpoints,
            ports: vec![SlicePort {
                name: Some(port.0.to_string()),
                port: Some(port.1),
                protocol: Some(port.2),
            }],
        }
    }

    fn make_cache() -> EndpointSliceCache {
        EndpointSliceCache::new("node-a", IpFamily::IPv4)
    }

    fn http_spn() -> ServicePortName {
        ServicePortName::new(NamespacedName::new("ns", "svc"), "http", Protocol::Tcp)
    }

    #[test]
    fn identical_update_is_not_a_change() {
        let cache = make_cache();
        let slice = make_slice("ns", "svc", "svc-abc", ("http", 80, Protocol::Tcp), vec![
            make_slice_endpoint("10.1.1.1", "node-a", true),
        ]);
        assert!(cache.update_pending(&slice, false));
        assert!(!cache.update_pending(&slice, false));
        assert_eq!(cache.checkout_changes(None).len(), 1);
        assert!(!cache.update_pending(&slice, false));
        assert_eq!(cache.pending(), 0);
    }

    #[test]
    fn removing_unknown_slice_is_noop() {
        let cache = make_cache();
        let slice = make_slice("ns", "svc", "svc-abc", ("http", 80, Protocol::Tcp), vec![]);
        assert!(!cache.update_pending(&slice, true));
    }

    #[test]
    fn slices_are_merged_and_deduplicated() {
        let cache = make_cache();
        let a = make_slice("ns", "svc", "svc-a", ("http", 80, Protocol::Tcp), vec![
            make_slice_endpoint("10.1.1.2", "node-b", true),
            make_slice_endpoint("10.1.1.1", "node-a", true),
        ]);
        let b = make_slice("ns", "svc", "svc-b", ("http", 80, Protocol::Tcp), vec![
            make_slice_endpoint("10.1.1.1", "node-a", true),
            make_slice_endpoint("10.1.1.3", "node-b", false),
        ]);
        cache.update_pending(&a, false);
        cache.update_pending(&b, false);

        let changes = cache.checkout_changes(None);
        let change = &changes[&NamespacedName::new("ns", "svc")];
        assert!(change.previous.is_none());
        let eps = &change.current.as_ref().unwrap()[&http_spn()];
        let names: Vec<&str> = eps.iter().map(|e| e.endpoint.as_str()).collect();
        assert_eq!(names, vec!["10.1.1.1:80", "10.1.1.2:80", "10.1.1.3:80"]);
        assert!(eps[0].is_local);
        assert!(!eps[2].ready && !eps[2].serving && !eps[2].terminating);
    }

    #[test]
    fn removal_produces_previous_only() {
        let cache = make_cache();
        let slice = make_slice("ns", "svc", "svc-a", ("http", 80, Protocol::Tcp), vec![
            make_slice_endpoint("10.1.1.1", "node-a", true),
        ]);
        cache.update_pending(&slice, false);
        cache.checkout_changes(None);

        assert!(cache.update_pending(&slice, true));
        let changes = cache.checkout_changes(None);
        let change = &changes[&NamespacedName::new("ns", "svc")];
        assert!(change.previous.is_some());
        assert!(change.current.is_none());
    }

    #[test]
    fn conditions_and_hints_are_projected() {
        let cache = make_cache();
        let mut ep = make_slice_endpoint("10.1.1.1", "node-a", false);
        ep.conditions.serving = Some(true);
        ep.conditions.terminating = Some(true);
        ep.zone = Some("zone-a".into());
        ep.hints = Some(EndpointHints {
            for_zones: vec!["zone-a".into()],
        });
        let mut slice = make_slice("ns", "svc", "svc-a", ("http", 80, Protocol::Tcp), vec![ep]);
        slice.ports.push(SlicePort {
            name: None,
            port: Some(81),
            protocol: Some(Protocol::Tcp),
        });
        cache.update_pending(&slice, false);

        let changes = cache.checkout_changes(None);
        let current = changes[&NamespacedName::new("ns", "svc")].current.clone().unwrap();
        assert_eq!(current.len(), 1);
        let ep = &current[&http_spn()][0];
        assert!(!ep.ready && ep.serving && ep.terminating);
        assert_eq!(ep.zone, "zone-a");
        assert!(ep.zone_hints.contains("zone-a"));
    }

    #[test]
    fn other_family_slices_are_unsupported() {
        let cache = make_cache();
        let mut slice = make_slice("ns", "svc", "svc-a", ("http", 80, Protocol::Tcp), vec![]);
        slice.address_type = AddressType::IPv6;
        assert!(!cache.supports_address_type(&slice));
        slice.address_type = AddressType::FQDN;
        assert!(!cache.supports_address_type(&slice));
    }
}
