use pkg_constants::proxy::LABEL_TOPOLOGY_ZONE;
use pkg_types::service::TrafficPolicy;
use std::collections::HashMap;
use tracing::warn;

use crate::config::ProxyFeatures;
use crate::endpoints::Endpoint;
use crate::service::ServicePort;

/// Narrow a service port's endpoints by traffic policy and zone hints.
///
/// Services with a node-local external policy are left alone: their local
/// filtering happens when real servers are chosen.
pub fn filter_endpoints(
    endpoints: &[Endpoint],
    svc: &ServicePort,
    node_labels: &HashMap<String, String>,
    features: &ProxyFeatures,
) -> Vec<Endpoint> {
    if svc.node_local_external {
        return endpoints.to_vec();
    }
    if features.internal_traffic_policy && svc.node_local_internal {
        return filter_internal_traffic_policy(svc.internal_traffic_policy, endpoints);
    }
    if features.topology_aware_hints {
        return filter_with_hints(endpoints, &svc.hints_annotation, node_labels);
    }
    endpoints.to_vec()
}

fn filter_internal_traffic_policy(
    policy: Option<TrafficPolicy>,
    endpoints: &[Endpoint],
) -> Vec<Endpoint> {
    if policy != Some(TrafficPolicy::Local) {
        return endpoints.to_vec();
    }
    endpoints.iter().filter(|e| e.is_local).cloned().collect()
}

fn filter_with_hints(
    endpoints: &[Endpoint],
    hints_annotation: &str,
    node_labels: &HashMap<String, String>,
) -> Vec<Endpoint> {
    if hints_annotation != "Auto" && hints_annotation != "auto" {
        if !hints_annotation.is_empty() && hints_annotation != "Disabled" {
            warn!("skipping topology hints: unknown annotation value {:?}", hints_annotation);
        }
        return endpoints.to_vec();
    }

    let zone = match node_labels.get(LABEL_TOPOLOGY_ZONE) {
        Some(z) if !z.is_empty() => z,
        _ => {
            warn!("skipping topology hints: node has no {} label", LABEL_TOPOLOGY_ZONE);
            return endpoints.to_vec();
        }
    };

    let mut filtered = Vec::new();
    for ep in endpoints {
        if ep.ready && ep.zone_hints.is_empty() {
            warn!("skipping topology hints: endpoint {} has no hints", ep);
            return endpoints.to_vec();
        }
        if ep.zone_hints.contains(zone) {
            filtered.push(ep.clone());
        }
    }
    if filtered.is_empty() {
        warn!("skipping topology hints: no endpoint is hinted for zone {}", zone);
        return endpoints.to_vec();
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::meta::Protocol;
    use std::collections::{BTreeMap, BTreeSet};

    fn make_port() -> ServicePort {
        ServicePort {
            cluster_ip: "10.0.0.5".parse().unwrap(),
            port: 80,
            protocol: Protocol::Tcp,
            node_port: 0,
            session_affinity_seconds: None,
            external_ips: vec![],
            load_balancer_ips: vec![],
            load_balancer_source_ranges: vec![],
            health_check_node_port: 0,
            node_local_external: false,
            node_local_internal: false,
            internal_traffic_policy: None,
            hints_annotation: String::new(),
            extension: BTreeMap::new(),
        }
    }

    fn make_ep(ip: &str, local: bool, zones: &[&str]) -> Endpoint {
        Endpoint {
            is_local: local,
            ready: true,
            serving: true,
            zone_hints: zones.iter().map(|z| z.to_string()).collect::<BTreeSet<_>>(),
            ..Endpoint::new(ip, 8080)
        }
    }

    fn zone_labels(zone: &str) -> HashMap<String, String> {
        HashMap::from([(LABEL_TOPOLOGY_ZONE.to_string(), zone.to_string())])
    }

    #[test]
    fn internal_local_keeps_local_endpoints() {
        let mut svc = make_port();
        svc.node_local_internal = true;
        svc.internal_traffic_policy = Some(TrafficPolicy::Local);
        let eps = vec![make_ep("10.1.1.1", true, &[]), make_ep("10.1.1.2", false, &[])];
        let out = filter_endpoints(&eps, &svc, &HashMap::new(), &ProxyFeatures::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].endpoint, "10.1.1.1:8080");
    }

    #[test]
    fn hints_select_zone() {
        let mut svc = make_port();
        svc.hints_annotation = "Auto".into();
        let eps = vec![make_ep("10.1.1.1", false, &["a"]), make_ep("10.1.1.2", false, &["b"])];
        let out = filter_endpoints(&eps, &svc, &zone_labels("b"), &ProxyFeatures::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].endpoint, "10.1.1.2:8080");
    }

    #[test]
    fn hints_fall_back_to_all() {
        let mut svc = make_port();
        svc.hints_annotation = "auto".into();
        let partial = vec![make_ep("10.1.1.1", false, &["a"]), make_ep("10.1.1.2", false, &[])];
        let out = filter_endpoints(&partial, &svc, &zone_labels("a"), &ProxyFeatures::default());
        assert_eq!(out.len(), 2);

        let other_zone = vec![make_ep("10.1.1.1", false, &["a"])];
        let out = filter_endpoints(&other_zone, &svc, &zone_labels("c"), &ProxyFeatures::default());
        assert_eq!(out.len(), 1);

        let out = filter_endpoints(&other_zone, &svc, &HashMap::new(), &ProxyFeatures::default());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn external_local_is_never_filtered() {
        let mut svc = make_port();
        svc.node_local_external = true;
        svc.hints_annotation = "Auto".into();
        let eps = vec![make_ep("10.1.1.1", false, &["a"]), make_ep("10.1.1.2", false, &["b"])];
        let out = filter_endpoints(&eps, &svc, &zone_labels("a"), &ProxyFeatures::default());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn disabled_hints_feature_ignores_annotation() {
        let mut svc = make_port();
        svc.hints_annotation = "Auto".into();
        let features = ProxyFeatures {
            topology_aware_hints: false,
            ..Default::default()
        };
        let eps = vec![make_ep("10.1.1.1", false, &["a"]), make_ep("10.1.1.2", false, &["b"])];
        let out = filter_endpoints(&eps, &svc, &zone_labels("a"), &features);
        assert_eq!(out.len(), 2);
    }
}
