//! IPVS service proxy for k3rs nodes.
//!
//! Watch events feed the change trackers, the [`proxier::Proxier`] folds
//! pending changes into its service and endpoint maps, and each sync pass
//! converges IPVS virtual/real servers, ipsets and iptables rules to them.

pub mod config;
pub mod conntrack;
pub mod endpoints;
pub mod endpointslice_cache;
pub mod exec;
pub mod fake;
pub mod graceful_termination;
pub mod healthcheck;
pub mod iptables;
pub mod ipset;
pub mod ipvs;
pub mod metrics;
pub mod netlink;
pub mod port;
pub mod proxier;
pub mod runner;
pub mod service;
pub mod topology;

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
