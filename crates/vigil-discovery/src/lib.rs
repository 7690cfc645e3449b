//! Service discovery.
//!
//! Fuses process, netstat and container evidence into a stable service set,
//! and reconfigures metric inputs and checks as services come and go.

mod dynamic;
mod engine;
pub mod rules;

pub use dynamic::{ContainerNetwork, Discoverer, DynamicDiscovery, NetstatSource, ProcessSource};
pub use engine::{Collector, Discovery};
pub use rules::{service_by_command, ServiceRule};

use serde::Serialize;
use vigil_facts::ListenAddress;

/// Key uniquely identifying a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceKey {
    pub name: String,
    pub container_id: String,
}

/// A discovered service.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Service {
    pub name: String,
    /// Empty for services running directly on the host.
    pub container_id: String,
    pub container_name: String,
    pub listen_addresses: Vec<ListenAddress>,
    pub ip_address: String,
    pub exe_path: String,
    pub active: bool,
    /// Whether the endpoints were observed (netstat) rather than inferred
    /// from defaults or container metadata.
    pub has_netstat_info: bool,
}

impl Service {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            name: self.name.clone(),
            container_id: self.container_id.clone(),
        }
    }

    /// Addresses suitable for dialing: wildcard binds are rewritten to the
    /// service's primary IP.
    pub fn dial_addresses(&self) -> Vec<String> {
        self.listen_addresses
            .iter()
            .filter(|a| a.network == vigil_facts::SocketKind::Tcp)
            .map(|a| {
                let host = if a.address == "0.0.0.0" && !self.ip_address.is_empty() {
                    self.ip_address.as_str()
                } else {
                    a.address.as_str()
                };
                format!("{host}:{}", a.port)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_facts::SocketKind;

    #[test]
    fn dial_addresses_rewrite_wildcard_binds() {
        let service = Service {
            name: "memcached".to_string(),
            ip_address: "192.168.1.5".to_string(),
            listen_addresses: vec![
                ListenAddress::tcp("0.0.0.0", 11211),
                ListenAddress::tcp("127.0.0.1", 11212),
                ListenAddress {
                    network: SocketKind::Udp,
                    address: "0.0.0.0".to_string(),
                    port: 11211,
                },
            ],
            ..Service::default()
        };
        assert_eq!(
            service.dial_addresses(),
            vec!["192.168.1.5:11211".to_string(), "127.0.0.1:11212".to_string()]
        );
    }
}
