//! Polling informer: lists services, endpoint slices and nodes from the API
//! server and turns the differences between two polls into proxier events.

use anyhow::Result;
use pkg_proxy::proxier::Proxier;
use pkg_types::endpoint::EndpointSlice;
use pkg_types::node::Node;
use pkg_types::service::Service;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const SERVICES_PATH: &str = "/api/v1/services";
pub const ENDPOINT_SLICES_PATH: &str = "/api/v1/endpointslices";
pub const NODES_PATH: &str = "/api/v1/nodes";

/// One difference between the previous and the current listing.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta<T> {
    Added(T),
    Updated(T, T),
    Deleted(T),
}

/// Diff `items` against `known`, replacing `known` with `items`.
///
/// Objects are compared by their serialized form, so any field change
/// yields an update.
pub fn diff<T, K>(known: &mut HashMap<String, T>, items: Vec<T>, key: K) -> Vec<Delta<T>>
where
    T: Serialize + Clone,
    K: Fn(&T) -> String,
{
    let mut deltas = Vec::new();
    let mut next = HashMap::with_capacity(items.len());
    for item in items {
        let k = key(&item);
        match known.remove(&k) {
            None => deltas.push(Delta::Added(item.clone())),
            Some(previous) => {
                if serde_json::to_value(&previous).ok() != serde_json::to_value(&item).ok() {
                    deltas.push(Delta::Updated(previous, item.clone()));
                }
            }
        }
        next.insert(k, item);
    }
    let mut gone: Vec<(String, T)> = known.drain().collect();
    gone.sort_by(|a, b| a.0.cmp(&b.0));
    deltas.extend(gone.into_iter().map(|(_, item)| Delta::Deleted(item)));
    *known = next;
    deltas
}

pub struct Informer {
    client: reqwest::Client,
    server: String,
    token: String,
    hostname: String,
    services: HashMap<String, Service>,
    slices: HashMap<String, EndpointSlice>,
    nodes: HashMap<String, Node>,
    services_synced: bool,
    slices_synced: bool,
}

impl Informer {
    pub fn new(server: &str, token: &str, hostname: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            token: token.to_string(),
            hostname: hostname.to_string(),
            services: HashMap::new(),
            slices: HashMap::new(),
            nodes: HashMap::new(),
            services_synced: false,
            slices_synced: false,
        })
    }

    async fn list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let url = format!("{}{}", self.server, path);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("GET {} returned {}", url, resp.status());
        }
        Ok(resp.json().await?)
    }

    /// Poll every `interval` until the task is dropped.
    pub async fn run(mut self, proxier: Arc<Proxier>, interval: Duration) {
        info!("polling {} every {:?}", self.server, interval);
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.poll(&proxier).await;
        }
    }

    pub async fn poll(&mut self, proxier: &Proxier) {
        match self.list::<Service>(SERVICES_PATH).await {
            Ok(items) => {
                for delta in diff(&mut self.services, items, |s| s.namespaced_name().to_string()) {
                    match delta {
                        Delta::Added(s) => proxier.on_service_add(&s),
                        Delta::Updated(old, new) => proxier.on_service_update(Some(&old), Some(&new)),
                        Delta::Deleted(s) => proxier.on_service_delete(&s),
                    }
                }
                if !self.services_synced {
                    self.services_synced = true;
                    proxier.on_services_synced();
                }
            }
            Err(e) => warn!("failed to list services: {}", e),
        }

        match self.list::<EndpointSlice>(ENDPOINT_SLICES_PATH).await {
            Ok(items) => {
                for delta in diff(&mut self.slices, items, |s| format!("{}/{}", s.namespace, s.name)) {
                    match delta {
                        Delta::Added(s) => proxier.on_endpoint_slice_add(&s),
                        Delta::Updated(old, new) => proxier.on_endpoint_slice_update(&old, &new),
                        Delta::Deleted(s) => proxier.on_endpoint_slice_delete(&s),
                    }
                }
                if !self.slices_synced {
                    self.slices_synced = true;
                    proxier.on_endpoint_slices_synced();
                }
            }
            Err(e) => warn!("failed to list endpoint slices: {}", e),
        }

        match self.list::<Node>(NODES_PATH).await {
            Ok(items) => {
                let own: Vec<Node> = items.into_iter().filter(|n| n.name == self.hostname).collect();
                for delta in diff(&mut self.nodes, own, |n| n.name.clone()) {
                    match delta {
                        Delta::Added(n) => proxier.on_node_add(&n).await,
                        Delta::Updated(old, new) => proxier.on_node_update(&old, &new).await,
                        Delta::Deleted(n) => proxier.on_node_delete(&n).await,
                    }
                }
            }
            Err(e) => warn!("failed to list nodes: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node(name: &str, zone: &str) -> Node {
        Node {
            name: name.to_string(),
            labels: HashMap::from([("zone".to_string(), zone.to_string())]),
            ..Default::default()
        }
    }

    fn names(deltas: &[Delta<Node>]) -> Vec<String> {
        deltas
            .iter()
            .map(|d| match d {
                Delta::Added(n) => format!("+{}", n.name),
                Delta::Updated(_, n) => format!("~{}", n.name),
                Delta::Deleted(n) => format!("-{}", n.name),
            })
            .collect()
    }

    #[test]
    fn diff_reports_adds_updates_and_deletes() {
        let mut known = HashMap::new();
        let first = diff(&mut known, vec![make_node("a", "z1"), make_node("b", "z1")], |n| n.name.clone());
        let mut first = names(&first);
        first.sort();
        assert_eq!(first, vec!["+a", "+b"]);

        let second = diff(&mut known, vec![make_node("a", "z2"), make_node("c", "z1")], |n| n.name.clone());
        let mut second = names(&second);
        second.sort();
        assert_eq!(second, vec!["+c", "-b", "~a"]);
        assert_eq!(known.len(), 2);
    }

    #[test]
    fn unchanged_listing_yields_nothing() {
        let mut known = HashMap::new();
        diff(&mut known, vec![make_node("a", "z1")], |n| n.name.clone());
        assert!(diff(&mut known, vec![make_node("a", "z1")], |n| n.name.clone()).is_empty());
    }
}
