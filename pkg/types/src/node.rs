use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The subset of a Node the proxy cares about: its name and labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub address: String,
}
