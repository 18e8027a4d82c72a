//! Health endpoints served by the proxy.
//!
//! Each service with `externalTrafficPolicy: Local` gets its own listener on
//! its health check node port, answering 200 while this node has a local
//! ready endpoint and 503 otherwise, so external load balancers only send
//! traffic to nodes that can serve it. The proxier itself answers `/healthz`
//! and `/metrics` on the proxy port.

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pkg_metrics::MetricsRegistry;
use pkg_types::meta::NamespacedName;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::lock;

/// Per-service health check listeners.
#[async_trait]
pub trait ServiceHealthServer: Send + Sync {
    /// Make the set of listeners match `services` (service -> health port).
    async fn sync_services(&self, services: HashMap<NamespacedName, u16>) -> Result<()>;

    /// Record local endpoint counts. Known services missing from the map
    /// report 0.
    async fn sync_endpoints(&self, endpoints: HashMap<NamespacedName, usize>) -> Result<()>;
}

struct HcState {
    service: NamespacedName,
    local_endpoints: AtomicUsize,
}

struct HcInstance {
    port: u16,
    bound: SocketAddr,
    state: Arc<HcState>,
    task: JoinHandle<()>,
}

impl Drop for HcInstance {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// HTTP implementation of [`ServiceHealthServer`] built on axum.
pub struct HttpServiceHealthServer {
    bind_ip: IpAddr,
    services: DashMap<NamespacedName, HcInstance>,
}

impl HttpServiceHealthServer {
    pub fn new(bind_ip: Option<IpAddr>) -> Self {
        Self {
            bind_ip: bind_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            services: DashMap::new(),
        }
    }

    /// Address a service's listener is bound to.
    pub fn local_addr(&self, service: &NamespacedName) -> Option<SocketAddr> {
        self.services.get(service).map(|i| i.bound)
    }

    pub fn local_endpoints(&self, service: &NamespacedName) -> Option<usize> {
        self.services
            .get(service)
            .map(|i| i.state.local_endpoints.load(Ordering::Relaxed))
    }

    async fn listen(&self, service: &NamespacedName, port: u16) -> Result<HcInstance> {
        let listener = TcpListener::bind(SocketAddr::new(self.bind_ip, port)).await?;
        let bound = listener.local_addr()?;
        let state = Arc::new(HcState {
            service: service.clone(),
            local_endpoints: AtomicUsize::new(0),
        });
        let app = Router::new()
            .fallback(serve_service_health)
            .with_state(state.clone());
        let name = service.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("health check server for {} stopped: {}", name, e);
            }
        });
        Ok(HcInstance {
            port,
            bound,
            state,
            task,
        })
    }
}

#[async_trait]
impl ServiceHealthServer for HttpServiceHealthServer {
    async fn sync_services(&self, services: HashMap<NamespacedName, u16>) -> Result<()> {
        self.services.retain(|name, instance| {
            let keep = services.get(name) == Some(&instance.port);
            if !keep {
                info!("closing health check for {} on port {}", name, instance.port);
            }
            keep
        });

        for (name, port) in services {
            if self.services.contains_key(&name) {
                continue;
            }
            info!("opening health check for {} on port {}", name, port);
            match self.listen(&name, port).await {
                Ok(instance) => {
                    self.services.insert(name, instance);
                }
                Err(e) => error!("failed to open health check for {} on port {}: {}", name, port, e),
            }
        }
        Ok(())
    }

    async fn sync_endpoints(&self, endpoints: HashMap<NamespacedName, usize>) -> Result<()> {
        for name in endpoints.keys() {
            if !self.services.contains_key(name) {
                warn!("not saving endpoints for unknown health check service {}", name);
            }
        }
        for instance in self.services.iter() {
            let count = endpoints.get(instance.key()).copied().unwrap_or(0);
            instance.state.local_endpoints.store(count, Ordering::Relaxed);
        }
        Ok(())
    }
}

async fn serve_service_health(State(state): State<Arc<HcState>>) -> impl IntoResponse {
    let count = state.local_endpoints.load(Ordering::Relaxed);
    let status = if count > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "service": {
            "namespace": state.service.namespace,
            "name": state.service.name,
        },
        "localEndpoints": count,
    });
    (
        status,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        body.to_string(),
    )
}

#[derive(Default)]
struct Timestamps {
    last_queued: Option<DateTime<Utc>>,
    last_updated: Option<DateTime<Utc>>,
}

/// `/healthz` and `/metrics` of the proxy itself.
///
/// Healthy while every queued sync has been applied, or the oldest
/// unapplied one is younger than `health_timeout`.
pub struct ProxierHealthServer {
    addr: SocketAddr,
    health_timeout: Duration,
    times: Mutex<Timestamps>,
    metrics: Arc<MetricsRegistry>,
}

impl ProxierHealthServer {
    pub fn new(addr: SocketAddr, health_timeout: Duration, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            addr,
            health_timeout,
            times: Mutex::new(Timestamps::default()),
            metrics,
        }
    }

    /// A sync was requested.
    pub fn queued(&self) {
        let mut times = lock(&self.times);
        if times.last_queued.is_none() || times.last_updated >= times.last_queued {
            times.last_queued = Some(Utc::now());
        }
    }

    /// A sync pass completed.
    pub fn updated(&self) {
        lock(&self.times).last_updated = Some(Utc::now());
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Utc::now())
    }

    fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        let times = lock(&self.times);
        let Some(queued) = times.last_queued else {
            return true;
        };
        if times.last_updated.is_some_and(|updated| updated >= queued) {
            return true;
        }
        let timeout = chrono::Duration::from_std(self.health_timeout)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        now.signed_duration_since(queued) < timeout
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/healthz", get(serve_healthz))
            .route("/metrics", get(serve_metrics))
            .with_state(Arc::clone(self))
    }

    /// Serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("proxy health server listening on {}", self.addr);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn serve_healthz(State(server): State<Arc<ProxierHealthServer>>) -> impl IntoResponse {
    let now = Utc::now();
    let healthy = server.is_healthy_at(now);
    let last_updated = lock(&server.times).last_updated;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "lastUpdated": last_updated.map(|t| t.to_rfc3339()).unwrap_or_default(),
        "currentTime": now.to_rfc3339(),
    });
    (
        status,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        body.to_string(),
    )
}

async fn serve_metrics(State(server): State<Arc<ProxierHealthServer>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        server.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_name() -> NamespacedName {
        NamespacedName::new("ns", "svc")
    }

    async fn get(addr: SocketAddr) -> (u16, serde_json::Value, String) {
        let url = format!("http://127.0.0.1:{}/", addr.port());
        let resp = reqwest::get(url).await.unwrap();
        let status = resp.status().as_u16();
        let nosniff = resp
            .headers()
            .get("x-content-type-options")
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        let body: serde_json::Value = resp.json().await.unwrap();
        (status, body, nosniff)
    }

    #[tokio::test]
    async fn reports_local_endpoint_count() {
        let server = HttpServiceHealthServer::new(Some("127.0.0.1".parse().unwrap()));
        server
            .sync_services(HashMap::from([(make_name(), 0)]))
            .await
            .unwrap();
        let addr = server.local_addr(&make_name()).unwrap();

        server
            .sync_endpoints(HashMap::from([(make_name(), 2)]))
            .await
            .unwrap();
        let (status, body, nosniff) = get(addr).await;
        assert_eq!(status, 200);
        assert_eq!(body["localEndpoints"], 2);
        assert_eq!(body["service"]["namespace"], "ns");
        assert_eq!(body["service"]["name"], "svc");
        assert_eq!(nosniff, "nosniff");

        server.sync_endpoints(HashMap::new()).await.unwrap();
        let (status, body, _) = get(addr).await;
        assert_eq!(status, 503);
        assert_eq!(body["localEndpoints"], 0);
    }

    #[tokio::test]
    async fn unknown_services_are_ignored() {
        let server = HttpServiceHealthServer::new(Some("127.0.0.1".parse().unwrap()));
        server
            .sync_endpoints(HashMap::from([(make_name(), 3)]))
            .await
            .unwrap();
        assert_eq!(server.local_endpoints(&make_name()), None);
    }

    #[tokio::test]
    async fn removed_services_are_closed() {
        let server = HttpServiceHealthServer::new(Some("127.0.0.1".parse().unwrap()));
        server
            .sync_services(HashMap::from([(make_name(), 0)]))
            .await
            .unwrap();
        assert!(server.local_addr(&make_name()).is_some());
        server.sync_services(HashMap::new()).await.unwrap();
        assert!(server.local_addr(&make_name()).is_none());
    }

    #[test]
    fn proxier_health_follows_updates() {
        let server = ProxierHealthServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_secs(60),
            Arc::new(MetricsRegistry::new()),
        );
        assert!(server.is_healthy());

        server.queued();
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert!(server.is_healthy());
        assert!(!server.is_healthy_at(later));

        server.updated();
        assert!(server.is_healthy_at(later));
    }
}
