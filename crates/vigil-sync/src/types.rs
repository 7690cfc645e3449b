//! Objects exchanged with the remote API, and the disablement reasons.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Why outbound synchronization is currently disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisableReason {
    TooManyErrors,
    DuplicatedAgent,
    AgentTooOld,
    AuthenticationError,
    Maintenance,
}

impl std::fmt::Display for DisableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisableReason::TooManyErrors => write!(f, "too many errors"),
            DisableReason::DuplicatedAgent => write!(f, "duplicated agent"),
            DisableReason::AgentTooOld => write!(f, "agent too old"),
            DisableReason::AuthenticationError => write!(f, "authentication error"),
            DisableReason::Maintenance => write!(f, "maintenance"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteAgent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "account")]
    pub account_id: String,
    #[serde(default)]
    pub next_config_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "current_config")]
    pub current_config_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metrics_agent_whitelist: String,
    #[serde(default)]
    pub metrics_agent_resolution: u64,
    #[serde(default)]
    pub live_process_resolution: u64,
    #[serde(default)]
    pub docker_integration: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteFact {
    #[serde(default)]
    pub id: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteService {
    #[serde(default)]
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub instance: String,
    #[serde(default)]
    pub listen_addresses: String,
    #[serde(default)]
    pub exe_path: String,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteContainer {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub docker_id: String,
    #[serde(default)]
    pub docker_inspect: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_inspect_hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteMetric {
    #[serde(default)]
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, rename = "service", skip_serializing_if = "String::is_empty")]
    pub service_id: String,
    #[serde(default, rename = "container", skip_serializing_if = "String::is_empty")]
    pub container_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_of: String,
    #[serde(default)]
    pub threshold_low_warning: Option<f64>,
    #[serde(default)]
    pub threshold_low_critical: Option<f64>,
    #[serde(default)]
    pub threshold_high_warning: Option<f64>,
    #[serde(default)]
    pub threshold_high_critical: Option<f64>,
    #[serde(default)]
    pub unit: i32,
    #[serde(default)]
    pub unit_text: String,
    #[serde(default)]
    pub deactivated_at: Option<DateTime<Utc>>,
}

/// Remote objects mirrored between runs, persisted in the state store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncCache {
    pub agent: Option<RemoteAgent>,
    pub facts: Vec<RemoteFact>,
    pub services: Vec<RemoteService>,
    pub containers: Vec<RemoteContainer>,
    pub metrics: Vec<RemoteMetric>,
}

impl SyncCache {
    pub fn facts_by_key(&self) -> BTreeMap<String, String> {
        self.facts
            .iter()
            .map(|f| (f.key.clone(), f.value.clone()))
            .collect()
    }
}
