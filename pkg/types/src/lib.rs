//! API objects consumed by the k3rs service proxy.

pub mod config;
pub mod endpoint;
pub mod meta;
pub mod node;
pub mod service;
pub mod validate;
