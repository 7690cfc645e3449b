//! Dynamic discovery: the currently-running services, derived from live
//! process, netstat and container evidence.

use crate::rules::{self, keep_address};
use crate::Service;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use vigil_facts::{
    ContainerProvider, ListenAddress, NetstatProvider, Process, ProcessProvider, SocketKind,
};

#[async_trait]
pub trait ProcessSource: Send + Sync {
    async fn processes(&self, max_age: Duration) -> Result<HashMap<i32, Process>>;
}

#[async_trait]
impl ProcessSource for ProcessProvider {
    async fn processes(&self, max_age: Duration) -> Result<HashMap<i32, Process>> {
        ProcessProvider::processes(self, max_age).await
    }
}

pub trait NetstatSource: Send + Sync {
    fn netstat(&self, max_age: Duration) -> Result<HashMap<i32, Vec<ListenAddress>>>;
}

impl NetstatSource for NetstatProvider {
    fn netstat(&self, max_age: Duration) -> Result<HashMap<i32, Vec<ListenAddress>>> {
        NetstatProvider::netstat(self, max_age)
    }
}

#[async_trait]
pub trait ContainerNetwork: Send + Sync {
    async fn network_info(&self, container_id: &str) -> Option<(String, Vec<ListenAddress>)>;
}

#[async_trait]
impl ContainerNetwork for ContainerProvider {
    async fn network_info(&self, container_id: &str) -> Option<(String, Vec<ListenAddress>)> {
        ContainerProvider::network_info(self, container_id).await
    }
}

/// Something able to produce the observed service list.
#[async_trait]
pub trait Discoverer: Send + Sync {
    async fn discover(&self, max_age: Duration) -> Result<Vec<Service>>;
}

/// The production discoverer.
pub struct DynamicDiscovery {
    processes: Arc<dyn ProcessSource>,
    netstat: Arc<dyn NetstatSource>,
    containers: Option<Arc<dyn ContainerNetwork>>,
}

impl DynamicDiscovery {
    pub fn new(
        processes: Arc<dyn ProcessSource>,
        netstat: Arc<dyn NetstatSource>,
        containers: Option<Arc<dyn ContainerNetwork>>,
    ) -> DynamicDiscovery {
        DynamicDiscovery {
            processes,
            netstat,
            containers,
        }
    }

    async fn service_for_process(
        &self,
        process: &Process,
        netstat: &HashMap<i32, Vec<ListenAddress>>,
    ) -> Option<Service> {
        let rule = rules::service_by_command(&process.cmdline)?;

        let mut service = Service {
            name: rule.name.to_string(),
            container_id: process.container_id.clone(),
            container_name: process.container_name.clone(),
            exe_path: process.executable.clone(),
            active: true,
            ..Service::default()
        };

        let mut addresses: Vec<ListenAddress> = netstat
            .get(&process.pid)
            .map(|list| {
                list.iter()
                    .filter(|a| keep_address(a.port, a.network, rule))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        service.has_netstat_info = !addresses.is_empty();

        if addresses.is_empty() {
            if process.container_id.is_empty() {
                if rule.default_port != 0 {
                    addresses.push(ListenAddress {
                        network: rule.default_network,
                        address: "127.0.0.1".to_string(),
                        port: rule.default_port,
                    });
                }
            } else if let Some(containers) = &self.containers {
                if let Some((ip, container_addresses)) =
                    containers.network_info(&process.container_id).await
                {
                    service.ip_address = ip;
                    addresses = container_addresses;
                }
            }
        }

        if service.ip_address.is_empty() {
            service.ip_address = primary_ip(&addresses);
        }
        service.listen_addresses = addresses;
        Some(service)
    }
}

/// Primary IP of a service from its listen addresses: the first concrete
/// inet address, loopback when everything binds the wildcard.
fn primary_ip(addresses: &[ListenAddress]) -> String {
    for address in addresses {
        if address.network == SocketKind::Unix {
            continue;
        }
        if address.address != "0.0.0.0" && !address.address.is_empty() {
            return address.address.clone();
        }
    }
    "127.0.0.1".to_string()
}

#[async_trait]
impl Discoverer for DynamicDiscovery {
    async fn discover(&self, max_age: Duration) -> Result<Vec<Service>> {
        let processes = self.processes.processes(max_age).await?;
        let netstat = match self.netstat.netstat(max_age) {
            Ok(netstat) => netstat,
            Err(err) => {
                tracing::warn!(error = %err, "netstat unavailable, discovering without it");
                HashMap::new()
            }
        };

        let mut pids: Vec<i32> = processes.keys().copied().collect();
        pids.sort_unstable();

        let mut services: HashMap<(String, String), Service> = HashMap::new();
        for pid in pids {
            let process = &processes[&pid];
            let Some(service) = self.service_for_process(process, &netstat).await else {
                continue;
            };
            // One entry per (name, container): the first matching process
            // wins, workers of the same service do not multiply entries.
            services
                .entry((service.name.clone(), service.container_id.clone()))
                .or_insert(service);
        }
        Ok(services.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockProcesses(Vec<Process>);

    #[async_trait]
    impl ProcessSource for MockProcesses {
        async fn processes(&self, _max_age: Duration) -> Result<HashMap<i32, Process>> {
            Ok(self.0.iter().map(|p| (p.pid, p.clone())).collect())
        }
    }

    struct MockNetstat(HashMap<i32, Vec<ListenAddress>>);

    impl NetstatSource for MockNetstat {
        fn netstat(&self, _max_age: Duration) -> Result<HashMap<i32, Vec<ListenAddress>>> {
            Ok(self.0.clone())
        }
    }

    struct MockContainers {
        ip: String,
        addresses: Vec<ListenAddress>,
    }

    #[async_trait]
    impl ContainerNetwork for MockContainers {
        async fn network_info(&self, _id: &str) -> Option<(String, Vec<ListenAddress>)> {
            Some((self.ip.clone(), self.addresses.clone()))
        }
    }

    fn process(pid: i32, cmdline: &[&str], container_id: &str) -> Process {
        Process {
            pid,
            cmdline: cmdline.iter().map(|s| s.to_string()).collect(),
            container_id: container_id.to_string(),
            ..Process::default()
        }
    }

    fn discovery(
        processes: Vec<Process>,
        netstat: HashMap<i32, Vec<ListenAddress>>,
        containers: Option<MockContainers>,
    ) -> DynamicDiscovery {
        DynamicDiscovery::new(
            Arc::new(MockProcesses(processes)),
            Arc::new(MockNetstat(netstat)),
            containers.map(|c| Arc::new(c) as Arc<dyn ContainerNetwork>),
        )
    }

    #[tokio::test]
    async fn memcached_on_host() {
        let mut netstat = HashMap::new();
        netstat.insert(1547, vec![ListenAddress::tcp("127.0.0.1", 11211)]);
        let dd = discovery(
            vec![process(
                1547,
                &[
                    "/usr/bin/memcached",
                    "-m",
                    "64",
                    "-p",
                    "11211",
                    "-u",
                    "memcache",
                    "-l",
                    "127.0.0.1",
                ],
                "",
            )],
            netstat,
            None,
        );

        let services = dd.discover(Duration::ZERO).await.unwrap();
        assert_eq!(services.len(), 1);
        let service = &services[0];
        assert_eq!(service.name, "memcached");
        assert_eq!(service.container_id, "");
        assert_eq!(service.ip_address, "127.0.0.1");
        assert_eq!(
            service.listen_addresses,
            vec![ListenAddress::tcp("127.0.0.1", 11211)]
        );
        assert!(service.has_netstat_info);
    }

    #[tokio::test]
    async fn bind_all_resolves_to_loopback() {
        let mut netstat = HashMap::new();
        netstat.insert(42, vec![ListenAddress::tcp("0.0.0.0", 11211)]);
        let dd = discovery(
            vec![process(42, &["/usr/bin/memcached"], "")],
            netstat,
            None,
        );
        let services = dd.discover(Duration::ZERO).await.unwrap();
        assert_eq!(services[0].ip_address, "127.0.0.1");
        assert_eq!(
            services[0].listen_addresses,
            vec![ListenAddress::tcp("0.0.0.0", 11211)]
        );
    }

    #[tokio::test]
    async fn bind_specific_keeps_address() {
        let mut netstat = HashMap::new();
        netstat.insert(42, vec![ListenAddress::tcp("192.168.1.1", 11211)]);
        let dd = discovery(
            vec![process(42, &["/usr/bin/memcached"], "")],
            netstat,
            None,
        );
        let services = dd.discover(Duration::ZERO).await.unwrap();
        assert_eq!(services[0].ip_address, "192.168.1.1");
    }

    #[tokio::test]
    async fn no_netstat_falls_back_to_default_port() {
        let dd = discovery(
            vec![process(42, &["/usr/bin/memcached"], "")],
            HashMap::new(),
            None,
        );
        let services = dd.discover(Duration::ZERO).await.unwrap();
        let service = &services[0];
        assert_eq!(
            service.listen_addresses,
            vec![ListenAddress::tcp("127.0.0.1", 11211)]
        );
        assert_eq!(service.ip_address, "127.0.0.1");
        assert!(!service.has_netstat_info);
    }

    #[tokio::test]
    async fn haproxy_ephemeral_udp_port_is_dropped() {
        let mut netstat = HashMap::new();
        netstat.insert(
            42,
            vec![
                ListenAddress::tcp("0.0.0.0", 80),
                ListenAddress {
                    network: SocketKind::Udp,
                    address: "0.0.0.0".to_string(),
                    port: 42514,
                },
            ],
        );
        let dd = discovery(
            vec![process(
                42,
                &["/usr/sbin/haproxy", "-f", "/etc/haproxy/haproxy.cfg"],
                "",
            )],
            netstat,
            None,
        );
        let services = dd.discover(Duration::ZERO).await.unwrap();
        let service = &services[0];
        assert_eq!(service.name, "haproxy");
        assert_eq!(
            service.listen_addresses,
            vec![ListenAddress::tcp("0.0.0.0", 80)]
        );
        assert_eq!(service.ip_address, "127.0.0.1");
    }

    #[tokio::test]
    async fn redis_in_container_uses_container_endpoints() {
        let container_id = "5b8f83412931055bcc5da35e41ada85fd70015673163d56911cac4fe6693273f";
        let dd = discovery(
            vec![process(42, &["redis-server *:6379"], container_id)],
            HashMap::new(),
            Some(MockContainers {
                ip: "172.17.0.49".to_string(),
                addresses: vec![ListenAddress::tcp("172.17.0.49", 6379)],
            }),
        );
        let services = dd.discover(Duration::ZERO).await.unwrap();
        assert_eq!(services.len(), 1);
        let service = &services[0];
        assert_eq!(service.name, "redis");
        assert_eq!(service.container_id, container_id);
        assert_eq!(service.ip_address, "172.17.0.49");
        assert_eq!(
            service.listen_addresses,
            vec![ListenAddress::tcp("172.17.0.49", 6379)]
        );
        assert!(!service.has_netstat_info);
    }

    #[tokio::test]
    async fn worker_processes_collapse_into_one_service() {
        let mut netstat = HashMap::new();
        netstat.insert(100, vec![ListenAddress::tcp("0.0.0.0", 80)]);
        let dd = discovery(
            vec![
                process(100, &["nginx: master process"], ""),
                process(101, &["nginx: worker process"], ""),
            ],
            netstat,
            None,
        );
        let services = dd.discover(Duration::ZERO).await.unwrap();
        assert_eq!(services.len(), 1);
        assert!(services[0].has_netstat_info);
    }
}
