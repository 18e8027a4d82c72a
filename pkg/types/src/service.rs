use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::meta::{IpFamily, NamespacedName, Protocol};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::ClusterIP => write!(f, "ClusterIP"),
            ServiceType::NodePort => write!(f, "NodePort"),
            ServiceType::LoadBalancer => write!(f, "LoadBalancer"),
            ServiceType::ExternalName => write!(f, "ExternalName"),
        }
    }
}

/// Routing policy for external or internal traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrafficPolicy {
    #[default]
    Cluster,
    Local,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionAffinity {
    #[default]
    None,
    ClientIP,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicePort {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    pub port: u16,
    #[serde(default, alias = "target-port")]
    pub target_port: u16,
    #[serde(default, alias = "node-port")]
    pub node_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub selector: HashMap<String, String>,
    pub ports: Vec<ServicePort>,
    #[serde(default, alias = "type")]
    pub service_type: ServiceType,
    /// Primary cluster IP; `"None"` marks a headless service.
    #[serde(default)]
    pub cluster_ip: Option<String>,
    /// All cluster IPs (dual-stack), primary first.
    #[serde(default)]
    pub cluster_ips: Vec<String>,
    #[serde(default)]
    pub external_ips: Vec<String>,
    #[serde(default)]
    pub session_affinity: SessionAffinity,
    #[serde(default)]
    pub session_affinity_timeout_seconds: Option<u32>,
    #[serde(default)]
    pub load_balancer_source_ranges: Vec<String>,
    #[serde(default)]
    pub external_traffic_policy: TrafficPolicy,
    #[serde(default)]
    pub internal_traffic_policy: Option<TrafficPolicy>,
    #[serde(default)]
    pub health_check_node_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerIngress {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    #[serde(default)]
    pub load_balancer_ingress: Vec<LoadBalancerIngress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    pub spec: ServiceSpec,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Service {
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.name)
    }

    /// Headless and ExternalName services are never programmed into the dataplane.
    pub fn should_skip(&self) -> bool {
        if self.spec.service_type == ServiceType::ExternalName {
            return true;
        }
        match self.spec.cluster_ip.as_deref() {
            None | Some("") | Some("None") => self.spec.cluster_ips.is_empty(),
            Some(_) => false,
        }
    }

    /// Cluster IP of the given family, if the service has one.
    pub fn cluster_ip_for_family(&self, family: IpFamily) -> Option<String> {
        if !self.spec.cluster_ips.is_empty() {
            return self
                .spec
                .cluster_ips
                .iter()
                .find(|ip| family.matches_str(ip))
                .cloned();
        }
        self.spec
            .cluster_ip
            .as_ref()
            .filter(|ip| family.matches_str(ip))
            .cloned()
    }

    fn is_external(&self) -> bool {
        matches!(
            self.spec.service_type,
            ServiceType::NodePort | ServiceType::LoadBalancer
        )
    }

    /// External traffic must only reach endpoints on the receiving node.
    pub fn requests_only_local_traffic(&self) -> bool {
        self.is_external() && self.spec.external_traffic_policy == TrafficPolicy::Local
    }

    /// In-cluster traffic must only reach endpoints on the sending node.
    pub fn requests_only_local_traffic_for_internal(&self) -> bool {
        self.spec.internal_traffic_policy == Some(TrafficPolicy::Local)
    }

    /// Load balancers probe a per-service health check node port when the
    /// service keeps client source IPs.
    pub fn needs_health_check(&self) -> bool {
        self.spec.service_type == ServiceType::LoadBalancer
            && self.spec.external_traffic_policy == TrafficPolicy::Local
    }
}
