//! Remote synchronization.
//!
//! A long-running reconciliation loop against the backend REST API:
//! registration, duplicate-instance detection, per-entity sync steps and a
//! monotonic disablement gate with jittered exponential backoff.

pub mod client;
pub mod password;
pub mod types;

pub use client::{ApiClient, ApiError};
pub use password::generate_password;
pub use types::{DisableReason, SyncCache};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use types::{AccountConfig, RemoteAgent, RemoteContainer, RemoteFact, RemoteMetric, RemoteService};
use vigil_common::delay::jitter_delay;
use vigil_common::state::State;
use vigil_discovery::Discovery;
use vigil_facts::{ContainerProvider, FactProvider};
use vigil_store::Store;
use vigil_task::{Runner, Shutdown};

const STATE_AGENT_UUID: &str = "agent_uuid";
const STATE_PASSWORD: &str = "password";
const STATE_SYNC_CACHE: &str = "sync_cache";

const MIN_SYNC_INTERVAL: f64 = 15.0;
const MAX_BACKOFF_SECS: f64 = 900.0;
const FULL_SYNC_INTERVAL: f64 = 3600.0;
const DUPLICATE_DISABLE_SECS: f64 = 900.0;

#[derive(Debug, thiserror::Error)]
enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("sync: {0}")]
    Other(String),
}

impl SyncError {
    fn is_auth(&self) -> bool {
        matches!(self, SyncError::Api(err) if err.is_auth())
    }
}

/// Synchronizer configuration, from the agent's `remote` config section.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub api_base: String,
    pub account_id: String,
    pub registration_key: String,
    pub initial_agent_name: String,
    /// Domain appended to the agent id to form the API username.
    pub credential_domain: String,
}

/// Threshold configuration received from the backend, forwarded to the
/// threshold evaluator by the agent.
#[derive(Debug, Clone)]
pub struct ThresholdSpec {
    pub name: String,
    pub item: String,
    pub low_critical: Option<f64>,
    pub low_warning: Option<f64>,
    pub high_warning: Option<f64>,
    pub high_critical: Option<f64>,
    pub unit: i32,
    pub unit_text: String,
}

type ResolutionCallback = Box<dyn Fn(Duration) + Send + Sync>;
type ThresholdCallback = Box<dyn Fn(Vec<ThresholdSpec>) + Send + Sync>;
type DisableCallback = Box<dyn Fn(DisableReason, DateTime<Utc>) + Send + Sync>;

/// Hooks the agent installs to react to backend configuration.
#[derive(Default)]
pub struct Callbacks {
    pub update_metric_resolution: Option<ResolutionCallback>,
    pub update_thresholds: Option<ThresholdCallback>,
    pub on_disable: Option<DisableCallback>,
}

struct Control {
    agent_id: String,
    disabled_until: Option<DateTime<Utc>>,
    disable_reason: Option<DisableReason>,
    force_sync: HashMap<String, bool>,
    successive_errors: u32,
    last_sync: Option<DateTime<Utc>>,
    next_full_sync: DateTime<Utc>,
    last_fact_updated_at: String,
    last_metric_count: usize,
    cache: SyncCache,
}

pub struct Synchronizer {
    options: SyncOptions,
    callbacks: Callbacks,
    state: Arc<State>,
    facts: Arc<FactProvider>,
    discovery: Arc<Discovery>,
    store: Store,
    containers: Option<Arc<ContainerProvider>>,
    control: StdMutex<Control>,
}

/// Backoff base value in seconds after `successive_errors` failures.
fn backoff_secs(successive_errors: u32) -> f64 {
    (MIN_SYNC_INTERVAL + 1.55_f64.powi(successive_errors as i32)).min(MAX_BACKOFF_SECS)
}

/// Which sync steps run this iteration, and whether each is a full sync.
fn compute_sync_steps(
    full_sync: bool,
    facts_changed: bool,
    discovery_changed: bool,
    metrics_changed: bool,
    force: &mut HashMap<String, bool>,
) -> HashMap<String, bool> {
    let mut steps: HashMap<String, bool> = HashMap::new();
    if full_sync {
        steps.insert("agent".to_string(), true);
    }
    if full_sync || facts_changed {
        steps.insert("facts".to_string(), full_sync);
    }
    if full_sync || discovery_changed {
        steps.insert("services".to_string(), full_sync);
        steps.insert("containers".to_string(), full_sync);
    }
    if steps.contains_key("services") || steps.contains_key("containers") {
        // Metric registration may reference services and containers.
        steps.entry("metrics".to_string()).or_insert(false);
    }
    if full_sync || discovery_changed || metrics_changed {
        steps.insert("metrics".to_string(), full_sync);
    }
    for (name, full) in force.drain() {
        let entry = steps.entry(name).or_insert(false);
        *entry = *entry || full;
    }
    steps
}

/// Fact whose change under the same agent id reveals a cloned state file.
const DUPLICATE_FACTS: [&str; 3] = ["fqdn", "primary_address", "primary_mac_address"];

fn duplicate_change(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> Option<(&'static str, String, String)> {
    for name in DUPLICATE_FACTS {
        let (Some(old_value), Some(new_value)) = (old.get(name), new.get(name)) else {
            continue;
        };
        if old_value != new_value {
            return Some((name, old_value.clone(), new_value.clone()));
        }
    }
    None
}

/// Mask the middle of a registration key for log output.
fn mask_key(key: &str) -> String {
    key.chars()
        .enumerate()
        .map(|(i, c)| {
            if i >= 6 && i < key.chars().count().saturating_sub(4) {
                '*'
            } else {
                c
            }
        })
        .collect()
}

fn listen_addresses_field(service: &vigil_discovery::Service) -> String {
    let mut parts: Vec<String> = service
        .listen_addresses
        .iter()
        .map(|a| format!("{}/{}", a.to_dial_string(), a.network))
        .collect();
    parts.sort();
    parts.join(",")
}

impl Synchronizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: SyncOptions,
        callbacks: Callbacks,
        state: Arc<State>,
        facts: Arc<FactProvider>,
        discovery: Arc<Discovery>,
        store: Store,
        containers: Option<Arc<ContainerProvider>>,
    ) -> Synchronizer {
        let cache: SyncCache = state.get(STATE_SYNC_CACHE).unwrap_or_default();
        let agent_id: String = state.get(STATE_AGENT_UUID).unwrap_or_default();
        Synchronizer {
            options,
            callbacks,
            state,
            facts,
            discovery,
            store,
            containers,
            control: StdMutex::new(Control {
                agent_id,
                disabled_until: None,
                disable_reason: None,
                force_sync: HashMap::new(),
                successive_errors: 0,
                last_sync: None,
                next_full_sync: Utc::now(),
                last_fact_updated_at: String::new(),
                last_metric_count: 0,
                cache,
            }),
        }
    }

    pub fn agent_id(&self) -> String {
        self.control.lock().unwrap().agent_id.clone()
    }

    /// Disable outbound synchronization until `until`. Only extends the
    /// current deadline unless `force` is set.
    pub fn disable(&self, until: DateTime<Utc>, reason: DisableReason, force: bool) {
        let mut control = self.control.lock().unwrap();
        if force || control.disabled_until.map_or(true, |current| current < until) {
            control.disabled_until = Some(until);
            control.disable_reason = Some(reason);
        }
    }

    /// Enter or leave maintenance mode (an hour-long, renewable gate).
    pub fn set_maintenance(&self, enabled: bool) {
        if enabled {
            self.disable(
                Utc::now() + ChronoDuration::hours(1),
                DisableReason::Maintenance,
                true,
            );
        } else {
            self.disable(Utc::now(), DisableReason::Maintenance, true);
        }
    }

    /// Request a sync of one entity on the next iteration.
    pub fn force_sync(&self, entity: &str, full: bool) {
        let mut control = self.control.lock().unwrap();
        let entry = control.force_sync.entry(entity.to_string()).or_insert(false);
        *entry = *entry || full;
    }

    fn disabled_until(&self) -> (Option<DateTime<Utc>>, Option<DisableReason>) {
        let control = self.control.lock().unwrap();
        (control.disabled_until, control.disable_reason)
    }

    fn username(&self, agent_id: &str) -> String {
        format!("{}@{}", agent_id, self.options.credential_domain)
    }

    fn build_client(&self) -> Result<ApiClient, ApiError> {
        let control = self.control.lock().unwrap();
        let password: String = self.state.get(STATE_PASSWORD).unwrap_or_default();
        ApiClient::new(
            &self.options.api_base,
            &self.username(&control.agent_id),
            &password,
        )
    }

    fn save_cache(&self) {
        let control = self.control.lock().unwrap();
        if let Err(err) = self.state.set(STATE_SYNC_CACHE, &control.cache) {
            tracing::warn!(error = %err, "unable to persist sync cache");
        }
    }

    /// Sleep until the disablement deadline has passed, waking up every
    /// minute to log what we are waiting for.
    async fn wait_deadline(&self, shutdown: &Shutdown, minimal_delay: Duration) {
        let minimal_deadline = Utc::now()
            + ChronoDuration::from_std(minimal_delay).unwrap_or_else(|_| ChronoDuration::zero());
        loop {
            if shutdown.is_shutdown() {
                return;
            }
            let (deadline, reason) = self.disabled_until();
            let mut sleep_until = deadline.unwrap_or(minimal_deadline);
            if sleep_until < minimal_deadline {
                sleep_until = minimal_deadline;
            }
            let remaining = sleep_until - Utc::now();
            let Ok(remaining) = remaining.to_std() else {
                return;
            };
            if remaining.is_zero() {
                return;
            }
            let chunk = remaining.min(Duration::from_secs(60));
            if remaining > Duration::from_secs(60) {
                if let Some(reason) = reason {
                    tracing::info!(
                        remaining = ?remaining,
                        %reason,
                        "synchronization still waiting"
                    );
                }
            }
            if shutdown.sleep(chunk).await {
                return;
            }
        }
    }

    async fn register(&self) -> Result<(), SyncError> {
        let facts = self.facts.facts(Duration::from_secs(900));
        let fqdn = facts.get("fqdn").cloned().unwrap_or_default();
        if fqdn.is_empty() {
            return Err(SyncError::Other("unable to register, fqdn is not set".to_string()));
        }
        let mut name = self.options.initial_agent_name.clone();
        if name.is_empty() {
            name = fqdn.clone();
        }

        let password = generate_password(10);
        // Prove the state store is writable before the API call: losing the
        // returned credentials would orphan the registration.
        self.state
            .set(STATE_AGENT_UUID, &String::new())
            .map_err(|err| SyncError::Other(format!("state not writable: {err}")))?;

        let client = self.build_client()?;
        let registration_user = format!(
            "{}@{}",
            self.options.account_id, self.options.credential_domain
        );
        let (status, response): (u16, serde_json::Value) = client
            .post_with_credentials(
                "v1/agent/",
                &json!({
                    "account": self.options.account_id,
                    "initial_password": password,
                    "display_name": name,
                    "fqdn": fqdn,
                }),
                &registration_user,
                &self.options.registration_key,
            )
            .await?;
        if status != 201 {
            return Err(SyncError::Other(format!(
                "registration status code is {status}, want 201"
            )));
        }
        let agent_id = response
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if agent_id.is_empty() {
            return Err(SyncError::Other("registration returned no agent id".to_string()));
        }

        self.state
            .set(STATE_AGENT_UUID, &agent_id)
            .map_err(|err| SyncError::Other(format!("state not writable: {err}")))?;
        self.state
            .set(STATE_PASSWORD, &password)
            .map_err(|err| SyncError::Other(format!("state not writable: {err}")))?;
        self.control.lock().unwrap().agent_id = agent_id.clone();
        tracing::info!(agent_id = %agent_id, "registration successful");
        Ok(())
    }

    async fn check_duplicated(&self, client: &ApiClient) -> Result<(), SyncError> {
        let (old_facts, agent_id) = {
            let control = self.control.lock().unwrap();
            (control.cache.facts_by_key(), control.agent_id.clone())
        };
        let remote: Vec<RemoteFact> = client
            .list("v1/agentfact/", &[("agent", agent_id.as_str())])
            .await?;
        let new_facts: BTreeMap<String, String> = remote
            .iter()
            .map(|f| (f.key.clone(), f.value.clone()))
            .collect();
        {
            let mut control = self.control.lock().unwrap();
            control.cache.facts = remote;
        }

        if let Some((name, old_value, new_value)) = duplicate_change(&old_facts, &new_facts) {
            let until = Utc::now()
                + ChronoDuration::from_std(jitter_delay(
                    DUPLICATE_DISABLE_SECS,
                    0.05,
                    DUPLICATE_DISABLE_SECS,
                ))
                .unwrap_or_else(|_| ChronoDuration::seconds(900));
            self.disable(until, DisableReason::DuplicatedAgent, false);
            if let Some(callback) = &self.callbacks.on_disable {
                callback(DisableReason::DuplicatedAgent, until);
            }
            tracing::error!(
                fact = name,
                old = %old_value,
                new = %new_value,
                "detected duplicated state file; another agent is using the same credentials"
            );
            tracing::error!(
                "see https://docs.vigil.example/agent/duplicated-agent/ to migrate a cloned machine"
            );
            return Err(SyncError::Other("synchronization temporarily disabled".to_string()));
        }
        Ok(())
    }

    async fn sync_agent(&self, client: &ApiClient, _full: bool) -> Result<(), SyncError> {
        let agent_id = self.agent_id();
        let agent: RemoteAgent = client.get(&format!("v1/agent/{agent_id}/")).await?;
        let config_id = agent.current_config_id.clone();
        {
            let mut control = self.control.lock().unwrap();
            control.cache.agent = Some(agent);
        }
        if !config_id.is_empty() {
            let config: AccountConfig =
                client.get(&format!("v1/accountconfig/{config_id}/")).await?;
            if config.metrics_agent_resolution > 0 {
                if let Some(callback) = &self.callbacks.update_metric_resolution {
                    callback(Duration::from_secs(config.metrics_agent_resolution));
                }
            }
        }
        Ok(())
    }

    async fn sync_facts(&self, client: &ApiClient, _full: bool) -> Result<(), SyncError> {
        let agent_id = self.agent_id();
        let local = self.facts.facts(Duration::from_secs(86400));
        let remote: Vec<RemoteFact> = client
            .list("v1/agentfact/", &[("agent", agent_id.as_str())])
            .await?;

        let mut kept = Vec::new();
        for fact in remote {
            match local.get(&fact.key) {
                Some(value) if *value == fact.value => kept.push(fact),
                // Changed or removed facts are deleted then re-registered.
                _ => client.delete(&format!("v1/agentfact/{}/", fact.id)).await?,
            }
        }
        for (key, value) in &local {
            if kept.iter().any(|f| f.key == *key) {
                continue;
            }
            let created: RemoteFact = client
                .post(
                    "v1/agentfact/",
                    &json!({"agent": agent_id, "key": key, "value": value}),
                )
                .await?;
            kept.push(created);
        }

        let mut control = self.control.lock().unwrap();
        control.last_fact_updated_at = local.get("fact_updated_at").cloned().unwrap_or_default();
        control.cache.facts = kept;
        Ok(())
    }

    async fn sync_services(&self, client: &ApiClient, _full: bool) -> Result<(), SyncError> {
        let agent_id = self.agent_id();
        let local = self
            .discovery
            .discovery(Duration::from_secs(3600))
            .await
            .map_err(|err| SyncError::Other(err.to_string()))?;
        let mut remote: Vec<RemoteService> = client
            .list("v1/service/", &[("agent", agent_id.as_str())])
            .await?;

        for service in &local {
            let addresses = listen_addresses_field(service);
            let existing = remote
                .iter_mut()
                .find(|r| r.label == service.name && r.instance == service.container_name);
            match existing {
                Some(entry)
                    if entry.active == service.active
                        && entry.listen_addresses == addresses
                        && entry.exe_path == service.exe_path => {}
                Some(entry) => {
                    let updated: RemoteService = client
                        .put(
                            &format!("v1/service/{}/", entry.id),
                            &json!({
                                "label": service.name,
                                "instance": service.container_name,
                                "listen_addresses": addresses,
                                "exe_path": service.exe_path,
                                "active": service.active,
                            }),
                        )
                        .await?;
                    *entry = updated;
                }
                None => {
                    let created: RemoteService = client
                        .post(
                            "v1/service/",
                            &json!({
                                "account": self.options.account_id,
                                "agent": agent_id,
                                "label": service.name,
                                "instance": service.container_name,
                                "listen_addresses": addresses,
                                "exe_path": service.exe_path,
                                "active": service.active,
                            }),
                        )
                        .await?;
                    remote.push(created);
                }
            }
        }

        // Remote services we no longer discover are marked inactive.
        for entry in remote.iter_mut() {
            let known = local
                .iter()
                .any(|s| s.name == entry.label && s.container_name == entry.instance);
            if !known && entry.active {
                let updated: RemoteService = client
                    .put(
                        &format!("v1/service/{}/", entry.id),
                        &json!({"label": entry.label, "instance": entry.instance, "active": false}),
                    )
                    .await?;
                *entry = updated;
            }
        }

        self.control.lock().unwrap().cache.services = remote;
        Ok(())
    }

    async fn sync_containers(&self, client: &ApiClient, _full: bool) -> Result<(), SyncError> {
        let Some(containers) = &self.containers else {
            return Ok(());
        };
        let agent_id = self.agent_id();
        let local = containers
            .containers(Duration::from_secs(3600), false)
            .await
            .map_err(|err| SyncError::Other(err.to_string()))?;
        let mut remote: Vec<RemoteContainer> = client
            .list("v1/container/", &[("agent", agent_id.as_str())])
            .await?;

        for container in &local {
            let inspect_hash = sha256_hex(container.inspect_json.as_bytes());
            let existing = remote.iter_mut().find(|r| r.docker_id == container.id);
            match existing {
                Some(entry) if entry.docker_inspect_hash == inspect_hash => {}
                Some(entry) => {
                    let updated: RemoteContainer = client
                        .put(
                            &format!("v1/container/{}/", entry.id),
                            &json!({
                                "name": container.name,
                                "docker_id": container.id,
                                "docker_inspect": container.inspect_json,
                            }),
                        )
                        .await?;
                    *entry = updated;
                    entry.docker_inspect_hash = inspect_hash;
                }
                None => {
                    let mut created: RemoteContainer = client
                        .post(
                            "v1/container/",
                            &json!({
                                "agent": agent_id,
                                "name": container.name,
                                "docker_id": container.id,
                                "docker_inspect": container.inspect_json,
                            }),
                        )
                        .await?;
                    created.docker_inspect_hash = inspect_hash;
                    remote.push(created);
                }
            }
        }

        self.control.lock().unwrap().cache.containers = remote;
        Ok(())
    }

    async fn sync_metrics(&self, client: &ApiClient, full: bool) -> Result<(), SyncError> {
        let agent_id = self.agent_id();
        let local = self.store.latest_points();
        let mut remote: Vec<RemoteMetric> = client
            .list("v1/metric/", &[("agent", agent_id.as_str())])
            .await?;

        for point in &local {
            let label = point.name().to_string();
            let item = point.annotations.item.clone();
            let known = remote.iter().any(|m| {
                m.label == label && m.labels.get("item").map(String::as_str).unwrap_or("") == item
            });
            if known {
                continue;
            }
            let mut labels = BTreeMap::new();
            if !item.is_empty() {
                labels.insert("item".to_string(), item);
            }
            let created: RemoteMetric = client
                .post(
                    "v1/metric/",
                    &json!({
                        "agent": agent_id,
                        "label": label,
                        "labels": labels,
                        "status_of": point.annotations.status_of,
                    }),
                )
                .await?;
            remote.push(created);
        }

        if full {
            // Deactivate remote metrics the store no longer produces.
            for metric in remote.iter_mut() {
                if metric.deactivated_at.is_some() {
                    continue;
                }
                let still_local = local.iter().any(|p| {
                    p.name() == metric.label
                        && p.annotations.item
                            == metric
                                .labels
                                .get("item")
                                .cloned()
                                .unwrap_or_default()
                });
                if !still_local {
                    let updated: RemoteMetric = client
                        .patch(
                            &format!("v1/metric/{}/", metric.id),
                            &json!({
                                "deactivated_at":
                                    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
                            }),
                        )
                        .await?;
                    *metric = updated;
                }
            }
        }

        if let Some(callback) = &self.callbacks.update_thresholds {
            let specs: Vec<ThresholdSpec> = remote
                .iter()
                .filter(|m| m.deactivated_at.is_none())
                .map(|m| ThresholdSpec {
                    name: m.label.clone(),
                    item: m.labels.get("item").cloned().unwrap_or_default(),
                    low_critical: m.threshold_low_critical,
                    low_warning: m.threshold_low_warning,
                    high_warning: m.threshold_high_warning,
                    high_critical: m.threshold_high_critical,
                    unit: m.unit,
                    unit_text: m.unit_text.clone(),
                })
                .collect();
            callback(specs);
        }

        let mut control = self.control.lock().unwrap();
        control.last_metric_count = self.store.metrics_count();
        control.cache.metrics = remote;
        Ok(())
    }

    async fn run_once(&self, client: &ApiClient) -> Result<(), SyncError> {
        let steps = {
            let mut control = self.control.lock().unwrap();
            let now = Utc::now();
            let mut full_sync = control.next_full_sync <= now;
            if let Some(agent) = &control.cache.agent {
                if agent.next_config_at.is_some_and(|at| at <= now) {
                    full_sync = true;
                }
            }
            let local_facts = self.facts.facts(Duration::from_secs(86400));
            let facts_changed = control.last_fact_updated_at
                != local_facts
                    .get("fact_updated_at")
                    .cloned()
                    .unwrap_or_default();
            let discovery_changed = match (control.last_sync, self.discovery.last_update()) {
                (Some(last_sync), Some(updated)) => last_sync < updated,
                (None, _) => true,
                (_, None) => false,
            };
            let metrics_changed = control.last_metric_count != self.store.metrics_count();
            let mut force = std::mem::take(&mut control.force_sync);
            compute_sync_steps(
                full_sync,
                facts_changed,
                discovery_changed,
                metrics_changed,
                &mut force,
            )
        };

        if steps.is_empty() {
            return Ok(());
        }

        self.check_duplicated(client).await?;

        let started_at = Utc::now();
        let step_order = ["agent", "facts", "services", "containers", "metrics"];
        let mut last_error: Option<SyncError> = None;
        for name in step_order {
            let Some(&full) = steps.get(name) else {
                continue;
            };
            let (until, _) = self.disabled_until();
            if until.is_some_and(|until| Utc::now() < until) {
                if last_error.is_none() {
                    last_error = Some(SyncError::Other(
                        "synchronization temporarily disabled".to_string(),
                    ));
                }
                break;
            }
            let result = match name {
                "agent" => self.sync_agent(client, full).await,
                "facts" => self.sync_facts(client, full).await,
                "services" => self.sync_services(client, full).await,
                "containers" => self.sync_containers(client, full).await,
                "metrics" => self.sync_metrics(client, full).await,
                _ => Ok(()),
            };
            if let Err(err) = result {
                tracing::warn!(step = name, error = %err, "synchronization step failed");
                last_error = Some(err);
            }
        }

        let full_run = steps.len() == step_order.len();
        if let Some(err) = last_error {
            return Err(err);
        }
        {
            let mut control = self.control.lock().unwrap();
            control.last_sync = Some(started_at);
            if full_run {
                control.next_full_sync = Utc::now()
                    + ChronoDuration::from_std(jitter_delay(
                        FULL_SYNC_INTERVAL,
                        0.1,
                        FULL_SYNC_INTERVAL,
                    ))
                    .unwrap_or_else(|_| ChronoDuration::seconds(3600));
            }
        }
        if full_run {
            self.save_cache();
        }
        Ok(())
    }
}

fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[async_trait]
impl Runner for Synchronizer {
    async fn run(&self, shutdown: Shutdown) -> Result<()> {
        if self.options.account_id.is_empty() || self.options.registration_key.is_empty() {
            tracing::error!(
                "remote.account_id and/or remote.registration_key is undefined, remote synchronization disabled"
            );
            shutdown.wait().await;
            return Ok(());
        }

        if !self.agent_id().is_empty() {
            tracing::info!(agent_id = %self.agent_id(), "agent already registered");
        }

        let mut minimal_delay = Duration::ZERO;
        loop {
            self.wait_deadline(&shutdown, minimal_delay).await;
            if shutdown.is_shutdown() {
                self.save_cache();
                return Ok(());
            }

            if self.agent_id().is_empty() {
                if let Err(err) = self.register().await {
                    if err.is_auth() {
                        tracing::error!(
                            account_id = %self.options.account_id,
                            registration_key = %mask_key(&self.options.registration_key),
                            "wrong credentials for registration"
                        );
                    }
                    tracing::warn!(error = %err, "registration failed");
                    let n = {
                        let mut control = self.control.lock().unwrap();
                        control.successive_errors += 1;
                        control.successive_errors
                    };
                    let delay = jitter_delay(backoff_secs(n), 0.1, MAX_BACKOFF_SECS);
                    self.disable(
                        Utc::now() + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero()),
                        DisableReason::TooManyErrors,
                        false,
                    );
                    continue;
                }
            }

            let client = match self.build_client() {
                Ok(client) => client,
                Err(err) => {
                    tracing::error!(error = %err, "unable to create API client, is remote.api_base correct?");
                    minimal_delay = Duration::from_secs(60);
                    continue;
                }
            };

            match self.run_once(&client).await {
                Ok(()) => {
                    self.control.lock().unwrap().successive_errors = 0;
                    minimal_delay = jitter_delay(MIN_SYNC_INTERVAL, 0.05, MIN_SYNC_INTERVAL);
                }
                Err(err) => {
                    let n = {
                        let mut control = self.control.lock().unwrap();
                        control.successive_errors += 1;
                        control.successive_errors
                    };
                    let delay = jitter_delay(backoff_secs(n), 0.1, MAX_BACKOFF_SECS);
                    self.disable(
                        Utc::now() + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero()),
                        DisableReason::TooManyErrors,
                        false,
                    );
                    if err.is_auth() {
                        self.disable(
                            Utc::now() + ChronoDuration::hours(1),
                            DisableReason::AuthenticationError,
                            false,
                        );
                        tracing::error!(
                            agent_id = %self.agent_id(),
                            "unable to login with stored credentials, was this agent deleted on the backend?"
                        );
                    } else if n % 5 == 0 {
                        tracing::warn!(error = %err, "unable to synchronize with backend");
                    } else {
                        tracing::debug!(error = %err, "unable to synchronize with backend");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff_secs(1) > 15.0);
        assert!(backoff_secs(5) < backoff_secs(10));
        assert_eq!(backoff_secs(30), MAX_BACKOFF_SECS);
        // min(900, 15 + 1.55^n)
        assert!((backoff_secs(2) - (15.0 + 1.55 * 1.55)).abs() < 1e-9);
    }

    #[test]
    fn sync_steps_follow_dependencies() {
        let mut force = HashMap::new();
        let steps = compute_sync_steps(false, false, true, false, &mut force);
        assert!(steps.contains_key("services"));
        assert!(steps.contains_key("containers"));
        // Metrics follow services/containers automatically.
        assert_eq!(steps.get("metrics"), Some(&false));
        assert!(!steps.contains_key("agent"));

        let steps = compute_sync_steps(false, true, false, false, &mut force);
        assert_eq!(steps.len(), 1);
        assert!(steps.contains_key("facts"));

        let steps = compute_sync_steps(false, false, false, true, &mut force);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps.get("metrics"), Some(&false));
    }

    #[test]
    fn full_sync_requests_everything_as_full() {
        let mut force = HashMap::new();
        let steps = compute_sync_steps(true, false, false, false, &mut force);
        for name in ["agent", "facts", "services", "containers"] {
            assert_eq!(steps.get(name), Some(&true), "step {name}");
        }
        // Metrics are re-listed but not necessarily fully re-registered
        // unless the full-sync flag propagated to them.
        assert_eq!(steps.get("metrics"), Some(&true));
    }

    #[test]
    fn forced_steps_are_merged() {
        let mut force = HashMap::new();
        force.insert("metrics".to_string(), true);
        let steps = compute_sync_steps(false, false, false, false, &mut force);
        assert_eq!(steps.get("metrics"), Some(&true));
        assert!(force.is_empty());
    }

    #[test]
    fn duplicate_detection_on_identity_facts() {
        let mut old = BTreeMap::new();
        old.insert("fqdn".to_string(), "web-01.example.com".to_string());
        old.insert("primary_address".to_string(), "192.168.1.5".to_string());
        let mut new = old.clone();
        assert!(duplicate_change(&old, &new).is_none());

        new.insert("primary_address".to_string(), "192.168.1.99".to_string());
        let (name, old_value, new_value) = duplicate_change(&old, &new).unwrap();
        assert_eq!(name, "primary_address");
        assert_eq!(old_value, "192.168.1.5");
        assert_eq!(new_value, "192.168.1.99");

        // A fact only present on one side is not a duplicate signal.
        let empty = BTreeMap::new();
        assert!(duplicate_change(&empty, &new).is_none());
    }

    #[test]
    fn registration_key_is_masked_for_logs() {
        assert_eq!(mask_key("AAAAAABBBBBBCCCC"), "AAAAAA******CCCC");
        assert_eq!(mask_key("short"), "short");
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
