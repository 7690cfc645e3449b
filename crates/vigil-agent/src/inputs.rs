//! Built-in metric inputs: the system gatherer and the per-service input
//! registration driven by discovery.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use vigil_common::{Label, MetricAnnotations, MetricFamily, MetricKind, Sample};
use vigil_discovery::{Collector, Service};
use vigil_facts::ProcessProvider;
use vigil_metrics::{GatherState, Gatherer, GathererKind, Registry, SliceGatherer};

fn gauge(name: &str, help: &str, value: f64) -> MetricFamily {
    MetricFamily {
        name: name.to_string(),
        help: help.to_string(),
        kind: MetricKind::Gauge,
        samples: vec![Sample {
            labels: Vec::new(),
            value,
            timestamp: None,
        }],
    }
}

/// Host-level metrics derived from the process provider's top snapshot.
pub struct SystemGatherer {
    processes: Arc<ProcessProvider>,
}

impl SystemGatherer {
    pub fn new(processes: Arc<ProcessProvider>) -> SystemGatherer {
        SystemGatherer { processes }
    }
}

#[async_trait]
impl Gatherer for SystemGatherer {
    async fn gather(&self, _state: GatherState) -> Result<Vec<MetricFamily>> {
        let top = self.processes.top_info(Duration::from_secs(9)).await?;

        let mut families = vec![
            gauge("system_load1", "Load average over 1 minute", top.loads[0]),
            gauge("system_load5", "Load average over 5 minutes", top.loads[1]),
            gauge("system_load15", "Load average over 15 minutes", top.loads[2]),
            gauge("uptime_seconds", "System uptime", top.uptime as f64),
            gauge("users_logged", "Logged-in users", top.users as f64),
            gauge("cpu_user", "", top.cpu.user),
            gauge("cpu_system", "", top.cpu.system),
            gauge("cpu_idle", "", top.cpu.idle),
            gauge("cpu_wait", "", top.cpu.iowait),
            gauge("cpu_steal", "", top.cpu.steal),
            gauge("cpu_used", "CPU usage in percent", 100.0 - top.cpu.idle),
            gauge("mem_total", "", top.memory.total * 1024.0),
            gauge("mem_used", "", top.memory.used * 1024.0),
            gauge("mem_free", "", top.memory.free * 1024.0),
            gauge("mem_buffered", "", top.memory.buffers * 1024.0),
            gauge("mem_cached", "", top.memory.cached * 1024.0),
            gauge("swap_total", "", top.swap.total * 1024.0),
            gauge("swap_used", "", top.swap.used * 1024.0),
            gauge("swap_free", "", top.swap.free * 1024.0),
        ];
        if top.memory.total > 0.0 {
            families.push(gauge(
                "mem_used_perc",
                "Memory usage in percent",
                top.memory.used / top.memory.total * 100.0,
            ));
        }
        if top.swap.total > 0.0 {
            families.push(gauge(
                "swap_used_perc",
                "Swap usage in percent",
                top.swap.used / top.swap.total * 100.0,
            ));
        }
        families.push(gauge(
            "process_total",
            "Number of processes",
            top.processes.len() as f64,
        ));
        Ok(families)
    }
}

/// Bridges discovery's input reconfiguration onto the metric registry.
///
/// Protocol-specific service inputs are external plugins; the input created
/// here is the service-presence gauge every discovered service gets.
pub struct RegistryCollector {
    registry: Arc<Registry>,
}

impl RegistryCollector {
    pub fn new(registry: Arc<Registry>) -> RegistryCollector {
        RegistryCollector { registry }
    }
}

impl Collector for RegistryCollector {
    fn add_input(&self, service: &Service) -> Result<u32> {
        let family = gauge("service_active", "Discovered service is active", 1.0);
        let mut extra_labels = vec![Label::new("service", service.name.clone())];
        if !service.container_name.is_empty() {
            extra_labels.push(Label::new("item", service.container_name.clone()));
        }
        let annotations = MetricAnnotations {
            item: service.container_name.clone(),
            ..MetricAnnotations::default()
        };
        Ok(self.registry.register_gatherer(
            Arc::new(SliceGatherer(vec![family])),
            extra_labels,
            annotations,
            GathererKind::Normal,
        ))
    }

    fn remove_input(&self, id: u32) {
        self.registry.unregister(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_metrics::QueryType;

    #[tokio::test]
    async fn service_inputs_register_and_unregister() {
        let registry = Arc::new(Registry::new());
        let collector = RegistryCollector::new(registry.clone());
        let service = Service {
            name: "redis".to_string(),
            container_name: "redis-cache".to_string(),
            ..Service::default()
        };

        let id = collector.add_input(&service).unwrap();
        let families = registry
            .gather_with_state(GatherState {
                query_type: QueryType::All,
                no_tick: false,
            })
            .await;
        let family = families.iter().find(|f| f.name == "service_active").unwrap();
        let labels = &family.samples[0].labels;
        assert!(labels.contains(&Label::new("service", "redis")));
        assert!(labels.contains(&Label::new("item", "redis-cache")));

        collector.remove_input(id);
        let families = registry
            .gather_with_state(GatherState::default())
            .await;
        assert!(!families.iter().any(|f| f.name == "service_active"));
    }
}
