//! Service proxy behaviour constants.

use std::time::Duration;

/// Maximum interval between two full syncs, even without any change.
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(30);

/// Minimum interval between two syncs; bursts of changes are coalesced.
pub const DEFAULT_MIN_SYNC_PERIOD: Duration = Duration::from_secs(1);

/// Default IPVS scheduler algorithm (round robin).
pub const DEFAULT_SCHEDULER: &str = "rr";

/// How often pending real-server deletions are re-checked.
pub const RS_CHECK_DELETE_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound a real server may spend draining before it is force-deleted.
pub const RS_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Default `ClientIP` session affinity timeout (3 hours).
pub const DEFAULT_CLIENT_IP_AFFINITY_SECONDS: u32 = 10800;

/// Informer poll interval against the API server.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

// ─── Well-known labels and annotations ───────────────────────────────────

/// Label on an EndpointSlice naming the owning Service.
pub const LABEL_SERVICE_NAME: &str = "kubernetes.io/service-name";

/// Node label carrying the topology zone.
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";

/// Annotation carrying the time of the change that produced an endpoints object.
pub const ANNOTATION_LAST_CHANGE_TRIGGER_TIME: &str =
    "endpoints.kubernetes.io/last-change-trigger-time";

/// Service annotation enabling topology-aware hints.
pub const ANNOTATION_TOPOLOGY_AWARE_HINTS: &str = "service.kubernetes.io/topology-aware-hints";
