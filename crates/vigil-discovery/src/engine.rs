//! The discovery engine: stable service set plus input/check
//! reconfiguration.

use crate::dynamic::Discoverer;
use crate::{Service, ServiceKey};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use vigil_check::{BaseCheck, NtpProbe, Probe, TcpProbe};
use vigil_facts::SocketKind;
use vigil_store::FieldsAccumulator;
use vigil_task::Registry as TaskRegistry;

/// Receives metric-input reconfiguration as services appear and vanish.
pub trait Collector: Send + Sync {
    fn add_input(&self, service: &Service) -> Result<u32>;
    fn remove_input(&self, id: u32);
}

struct Inner {
    services: HashMap<ServiceKey, Service>,
    last_config: HashMap<ServiceKey, Service>,
    active_inputs: HashMap<ServiceKey, u32>,
    active_checks: HashMap<ServiceKey, u32>,
    last_refresh: Option<Instant>,
}

/// Discovery keeps the merged service map and drives the collector and the
/// check tasks from it. All mutation happens under one lock, so a caller
/// observing a service is guaranteed its input and check exist.
pub struct Discovery {
    dynamic: Arc<dyn Discoverer>,
    collector: Arc<dyn Collector>,
    tasks: Arc<TaskRegistry>,
    accumulator: FieldsAccumulator,
    inner: Mutex<Inner>,
    last_update: StdMutex<Option<DateTime<Utc>>>,
}

impl Discovery {
    pub fn new(
        dynamic: Arc<dyn Discoverer>,
        collector: Arc<dyn Collector>,
        tasks: Arc<TaskRegistry>,
        accumulator: FieldsAccumulator,
        initial_services: Vec<Service>,
    ) -> Discovery {
        let services = initial_services
            .into_iter()
            .map(|s| (s.key(), s))
            .collect();
        Discovery {
            dynamic,
            collector,
            tasks,
            accumulator,
            inner: Mutex::new(Inner {
                services,
                last_config: HashMap::new(),
                active_inputs: HashMap::new(),
                active_checks: HashMap::new(),
                last_refresh: None,
            }),
            last_update: StdMutex::new(None),
        }
    }

    /// The known services, refreshed when the snapshot is older than
    /// `max_age`.
    pub async fn discovery(&self, max_age: Duration) -> Result<Vec<Service>> {
        let mut inner = self.inner.lock().await;
        let stale = match inner.last_refresh {
            Some(at) => at.elapsed() > max_age,
            None => true,
        };
        if stale {
            self.update_discovery(&mut inner).await?;
            self.reconfigure(&mut inner).await;
            inner.last_refresh = Some(Instant::now());
            *self.last_update.lock().unwrap() = Some(Utc::now());
        }
        Ok(inner.services.values().cloned().collect())
    }

    /// When the service map last changed, for the synchronizer.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.last_update.lock().unwrap()
    }

    /// Forget the given keys, then force an immediate re-discovery. Used
    /// when the backend reports a service as deleted.
    pub async fn remove_if_non_running(&self, keys: &[ServiceKey]) {
        let deleted = {
            let mut inner = self.inner.lock().await;
            let mut deleted = false;
            for key in keys {
                deleted |= inner.services.remove(key).is_some();
            }
            deleted
        };
        if deleted {
            if let Err(err) = self.discovery(Duration::ZERO).await {
                tracing::debug!(error = %err, "re-discovery after removal failed");
            }
        }
    }

    /// Tear down every input and check created by this engine.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        let input_ids: Vec<u32> = inner.active_inputs.drain().map(|(_, id)| id).collect();
        for id in input_ids {
            self.collector.remove_input(id);
        }
        let check_ids: Vec<u32> = inner.active_checks.drain().map(|(_, id)| id).collect();
        for id in check_ids {
            self.tasks.remove_task(id).await;
        }
        inner.last_config.clear();
    }

    async fn update_discovery(&self, inner: &mut Inner) -> Result<()> {
        let observed = self.dynamic.discover(Duration::ZERO).await?;

        let mut services: HashMap<ServiceKey, Service> = inner
            .services
            .iter()
            .map(|(key, service)| {
                let mut service = service.clone();
                service.active = false;
                (key.clone(), service)
            })
            .collect();

        for mut service in observed {
            let key = service.key();
            if let Some(previous) = services.get(&key) {
                // A refresh that lost netstat visibility keeps the
                // previously observed endpoints.
                if previous.has_netstat_info && !service.has_netstat_info {
                    service.listen_addresses = previous.listen_addresses.clone();
                    service.ip_address = previous.ip_address.clone();
                    service.has_netstat_info = true;
                }
            }
            services.insert(key, service);
        }

        inner.services = services;
        Ok(())
    }

    async fn reconfigure(&self, inner: &mut Inner) {
        let previous = std::mem::take(&mut inner.last_config);
        let current = inner.services.clone();

        // Vanished or changed services lose their input and check first.
        for (key, old_service) in &previous {
            let changed = match current.get(key) {
                Some(new_service) => service_changed(old_service, new_service),
                None => true,
            };
            if !changed {
                continue;
            }
            if let Some(id) = inner.active_inputs.remove(key) {
                self.collector.remove_input(id);
            }
            if let Some(id) = inner.active_checks.remove(key) {
                self.tasks.remove_task(id).await;
            }
        }

        for (key, service) in &current {
            if !service.active {
                continue;
            }
            if !inner.active_inputs.contains_key(key) {
                match self.collector.add_input(service) {
                    Ok(id) => {
                        inner.active_inputs.insert(key.clone(), id);
                    }
                    Err(err) => {
                        tracing::warn!(service = %service.name, error = %err, "unable to add metric input");
                    }
                }
            }
            if !inner.active_checks.contains_key(key) {
                if let Some(check) = self.create_check(service) {
                    let task_name = format!("check-{}", service.name);
                    let id = self.tasks.add_task(check, &task_name);
                    inner.active_checks.insert(key.clone(), id);
                }
            }
        }

        inner.last_config = current;
    }

    fn create_check(&self, service: &Service) -> Option<Arc<BaseCheck>> {
        let tcp_addresses = service.dial_addresses();
        let item = if service.container_name.is_empty() {
            String::new()
        } else {
            service.container_name.clone()
        };
        let metric_name = format!("{}_status", service.name);

        if service.name == "ntp" {
            let udp_address = service
                .listen_addresses
                .iter()
                .find(|a| a.network == SocketKind::Udp)
                .map(|a| {
                    let host = if a.address == "0.0.0.0" {
                        service.ip_address.as_str()
                    } else {
                        a.address.as_str()
                    };
                    format!("{host}:{}", a.port)
                })?;
            let probe = Arc::new(NtpProbe::new(udp_address)) as Arc<dyn Probe>;
            return Some(Arc::new(BaseCheck::new(
                metric_name,
                item,
                String::new(),
                tcp_addresses,
                true,
                Some(probe),
                self.accumulator.clone(),
            )));
        }

        let main_address = tcp_addresses.first()?.clone();
        let probe = Arc::new(TcpProbe::new(main_address.clone())) as Arc<dyn Probe>;
        Some(Arc::new(BaseCheck::new(
            metric_name,
            item,
            main_address,
            tcp_addresses,
            true,
            Some(probe),
            self.accumulator.clone(),
        )))
    }
}

fn service_changed(a: &Service, b: &Service) -> bool {
    a.name != b.name
        || a.container_id != b.container_id
        || a.ip_address != b.ip_address
        || a.listen_addresses != b.listen_addresses
        || a.active != b.active
        || a.has_netstat_info != b.has_netstat_info
}
