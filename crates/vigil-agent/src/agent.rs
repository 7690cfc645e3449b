//! Glue between the components: wiring, supervised tasks and signal
//! handling.

use crate::api::{ApiState, LocalApi};
use crate::config::AgentConfig;
use crate::debouncer::TriggerHandler;
use crate::inputs::{RegistryCollector, SystemGatherer};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use vigil_common::state::State;
use vigil_common::{MetricAnnotations, PointPusher};
use vigil_discovery::{Discovery, DynamicDiscovery};
use vigil_facts::process::ContainerTops;
use vigil_facts::{ContainerProvider, FactProvider, NetstatProvider, ProcessProvider};
use vigil_metrics::{GathererKind, Registry};
use vigil_store::{FieldsAccumulator, Store};
use vigil_sync::{Callbacks, SyncOptions, Synchronizer, ThresholdSpec};
use vigil_task::{Registry as TaskRegistry, Runner, Shutdown, ShutdownHandle};
use vigil_threshold::{MetricNameItem, Registry as ThresholdRegistry, Threshold, Unit};

const CHECK_POINTS_TTL: Duration = Duration::from_secs(300);

pub async fn run(config: AgentConfig) -> Result<()> {
    let state = Arc::new(
        State::load(&config.agent.state_file).with_context(|| {
            format!("unable to load {}", config.agent.state_file.display())
        })?,
    );
    // An unwritable state file at startup is fatal: registration
    // credentials could not be persisted later.
    state
        .save()
        .with_context(|| format!("state file {} is not writable", config.agent.state_file.display()))?;

    let (shutdown_handle, shutdown) = ShutdownHandle::new();
    let shutdown_handle = Arc::new(shutdown_handle);
    let tasks = Arc::new(TaskRegistry::new(shutdown.clone()));

    // Point pipeline: registry -> threshold evaluator -> store.
    let store = Store::new();
    let threshold = Arc::new(ThresholdRegistry::new(state.clone()));
    apply_config_thresholds(&threshold, &config);
    let threshold_pusher = threshold.wrap_pusher(Arc::new(store.clone()) as Arc<dyn PointPusher>);

    let registry = Arc::new(Registry::new());
    registry.set_pusher(threshold_pusher);
    registry.update_delay(Duration::from_secs(config.metric.resolution.max(1)));

    let container = if config.container.enabled && config.container.socket.exists() {
        Some(Arc::new(ContainerProvider::new(&config.container.socket)))
    } else {
        None
    };

    let facts = Arc::new(FactProvider::new());
    facts.set_fact("installation_format", "manual");
    if let Some(container) = &container {
        let provider = Arc::clone(container);
        facts.add_callback(Arc::new(move || provider.fact_snapshot()));
    }

    let processes = Arc::new(ProcessProvider::new(
        container
            .clone()
            .map(|c| c as Arc<dyn ContainerTops>),
    ));
    let netstat = Arc::new(NetstatProvider::new(&config.agent.netstat_file));

    let accumulator = FieldsAccumulator::new(registry.with_ttl(CHECK_POINTS_TTL));
    let dynamic = Arc::new(DynamicDiscovery::new(
        processes.clone(),
        netstat,
        container
            .clone()
            .map(|c| c as Arc<dyn vigil_discovery::ContainerNetwork>),
    ));
    let collector = Arc::new(RegistryCollector::new(registry.clone()));
    let discovery = Arc::new(Discovery::new(
        dynamic,
        collector,
        tasks.clone(),
        accumulator,
        Vec::new(),
    ));

    registry.register_gatherer(
        Arc::new(SystemGatherer::new(processes.clone())),
        Vec::new(),
        MetricAnnotations::default(),
        GathererKind::Normal,
    );

    let trigger = Arc::new(TriggerHandler::new(discovery.clone(), facts.clone()));

    let api = Arc::new(LocalApi::new(
        format!("{}:{}", config.web.listen_address, config.web.listen_port),
        Arc::new(ApiState {
            registry: registry.clone(),
            store: store.clone(),
            facts: facts.clone(),
            processes: processes.clone(),
            discovery: discovery.clone(),
        }),
    ));

    let synchronizer = if config.remote.enabled {
        let threshold_for_sync = threshold.clone();
        let registry_for_sync = registry.clone();
        let config_thresholds = config.thresholds.clone();
        Some(Arc::new(Synchronizer::new(
            SyncOptions {
                api_base: config.remote.api_base.clone(),
                account_id: config.remote.account_id.clone(),
                registration_key: config.remote.registration_key.clone(),
                initial_agent_name: config.remote.initial_agent_name.clone(),
                credential_domain: config.remote.credential_domain.clone(),
            },
            Callbacks {
                update_metric_resolution: Some(Box::new(move |delay| {
                    registry_for_sync.update_delay(delay);
                })),
                update_thresholds: Some(Box::new(move |specs| {
                    apply_remote_thresholds(&threshold_for_sync, &config_thresholds, specs);
                })),
                on_disable: None,
            },
            state.clone(),
            facts.clone(),
            discovery.clone(),
            store.clone(),
            container.clone(),
        )))
    } else {
        None
    };

    let mut task_ids: HashMap<&'static str, u32> = HashMap::new();
    task_ids.insert("store", tasks.add_task(Arc::new(store.clone()), "store"));
    task_ids.insert("threshold", tasks.add_task(threshold.clone(), "threshold"));
    task_ids.insert("collector", tasks.add_task(registry.clone(), "collector"));
    task_ids.insert("api", tasks.add_task(api, "api"));
    task_ids.insert("trigger", tasks.add_task(trigger.clone(), "trigger"));
    task_ids.insert(
        "hourly-discovery",
        tasks.add_task(
            Arc::new(HourlyDiscovery {
                trigger: trigger.clone(),
            }),
            "hourly-discovery",
        ),
    );
    task_ids.insert(
        "daily-facts",
        tasks.add_task(
            Arc::new(DailyFacts {
                trigger: trigger.clone(),
            }),
            "daily-facts",
        ),
    );
    task_ids.insert(
        "netstat-watcher",
        tasks.add_task(
            Arc::new(NetstatWatcher {
                path: config.agent.netstat_file.clone(),
                trigger: trigger.clone(),
            }),
            "netstat-watcher",
        ),
    );
    if let Some(synchronizer) = &synchronizer {
        task_ids.insert("sync", tasks.add_task(synchronizer.clone(), "sync"));
    }
    task_ids.insert(
        "health-check",
        tasks.add_task(
            Arc::new(HealthCheck {
                tasks: tasks.clone(),
                watched: task_ids
                    .iter()
                    .filter(|(name, _)| ["store", "collector", "sync"].contains(name))
                    .map(|(name, id)| (name.to_string(), *id))
                    .collect(),
                shutdown_handle: shutdown_handle.clone(),
            }),
            "health-check",
        ),
    );

    // First discovery right away; SIGHUP repeats it with a fact refresh.
    trigger.fire(true, false);

    let mut sigint = signal(SignalKind::interrupt()).context("signal handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("signal handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("signal handler")?;
    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = sighup.recv() => {
                tracing::info!("SIGHUP received, refreshing discovery and facts");
                trigger.fire(true, true);
            }
            _ = shutdown.wait() => break,
        }
    }

    tracing::info!("shutting down");
    shutdown_handle.shutdown();
    tasks.close().await;
    discovery.close().await;
    tracing::debug!("agent stopped");
    Ok(())
}

fn config_threshold_tables(
    sections: &HashMap<String, crate::config::ThresholdSection>,
) -> HashMap<String, Threshold> {
    sections
        .iter()
        .map(|(name, section)| {
            (
                name.clone(),
                Threshold::from_limits(
                    section.low_critical,
                    section.low_warning,
                    section.high_warning,
                    section.high_critical,
                ),
            )
        })
        .collect()
}

fn apply_config_thresholds(threshold: &ThresholdRegistry, config: &AgentConfig) {
    threshold.set_thresholds(HashMap::new(), config_threshold_tables(&config.thresholds));
    threshold.set_soft_period(
        Duration::from_secs(config.metric.softstatus_period_default),
        config
            .metric
            .softstatus_period
            .iter()
            .map(|(name, secs)| (name.clone(), Duration::from_secs(*secs)))
            .collect(),
    );
}

/// Merge backend thresholds (per-item) over the configuration file's
/// per-name table, and install units.
fn apply_remote_thresholds(
    threshold: &ThresholdRegistry,
    config_thresholds: &HashMap<String, crate::config::ThresholdSection>,
    specs: Vec<ThresholdSpec>,
) {
    let mut with_item = HashMap::new();
    let mut units = HashMap::new();
    for spec in specs {
        let key = MetricNameItem::new(spec.name.clone(), spec.item.clone());
        let threshold_value = Threshold::from_limits(
            spec.low_critical,
            spec.low_warning,
            spec.high_warning,
            spec.high_critical,
        );
        if !threshold_value.is_zero() {
            with_item.insert(key.clone(), threshold_value);
        }
        if spec.unit != 0 || !spec.unit_text.is_empty() {
            units.insert(
                key,
                Unit {
                    unit_type: spec.unit,
                    unit_text: spec.unit_text,
                },
            );
        }
    }
    threshold.set_thresholds(with_item, config_threshold_tables(config_thresholds));
    threshold.set_units(units);
}

struct HourlyDiscovery {
    trigger: Arc<TriggerHandler>,
}

#[async_trait]
impl Runner for HourlyDiscovery {
    async fn run(&self, shutdown: Shutdown) -> Result<()> {
        if shutdown.sleep(Duration::from_secs(15)).await {
            return Ok(());
        }
        self.trigger.fire(true, false);
        loop {
            if shutdown.sleep(Duration::from_secs(3600)).await {
                return Ok(());
            }
            self.trigger.fire(true, false);
        }
    }
}

struct DailyFacts {
    trigger: Arc<TriggerHandler>,
}

#[async_trait]
impl Runner for DailyFacts {
    async fn run(&self, shutdown: Shutdown) -> Result<()> {
        loop {
            if shutdown.sleep(Duration::from_secs(86400)).await {
                return Ok(());
            }
            self.trigger.fire(false, true);
        }
    }
}

/// Re-discover when the root-captured netstat snapshot is rewritten.
struct NetstatWatcher {
    path: std::path::PathBuf,
    trigger: Arc<TriggerHandler>,
}

#[async_trait]
impl Runner for NetstatWatcher {
    async fn run(&self, shutdown: Shutdown) -> Result<()> {
        let mtime = |path: &std::path::Path| {
            std::fs::metadata(path).and_then(|m| m.modified()).ok()
        };
        let mut last = mtime(&self.path);
        loop {
            if shutdown.sleep(Duration::from_secs(15)).await {
                return Ok(());
            }
            let current = mtime(&self.path);
            if current.is_some() && current != last {
                tracing::debug!(path = %self.path.display(), "netstat file changed");
                self.trigger.fire(true, false);
            }
            last = current;
        }
    }
}

/// Stop the agent when a mandatory task died.
struct HealthCheck {
    tasks: Arc<TaskRegistry>,
    watched: Vec<(String, u32)>,
    shutdown_handle: Arc<ShutdownHandle>,
}

#[async_trait]
impl Runner for HealthCheck {
    async fn run(&self, shutdown: Shutdown) -> Result<()> {
        loop {
            if shutdown.sleep(Duration::from_secs(60)).await {
                return Ok(());
            }
            for (name, id) in &self.watched {
                if !self.tasks.is_running(*id) {
                    tracing::error!(task = %name, "mandatory task died, stopping the agent");
                    self.shutdown_handle.shutdown();
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThresholdSection;

    #[test]
    fn config_thresholds_map_to_any_item_table() {
        let mut config = AgentConfig::default();
        config.thresholds.insert(
            "cpu_used".to_string(),
            ThresholdSection {
                high_warning: Some(80.0),
                high_critical: Some(90.0),
                ..ThresholdSection::default()
            },
        );
        let tables = config_threshold_tables(&config.thresholds);
        let threshold = tables.get("cpu_used").unwrap();
        assert_eq!(threshold.high_warning, 80.0);
        assert!(threshold.low_warning.is_nan());
    }
}
