//! Container inventory backed by the container engine's HTTP API over its
//! Unix socket.

use crate::netstat::{ListenAddress, SocketKind};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Utc};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

const ENGINE_TIMEOUT: Duration = Duration::from_secs(10);

/// A container known to the engine.
#[derive(Debug, Clone, Default)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub state: String,
    pub running: bool,
    pub ip_address: String,
    pub listen_addresses: Vec<ListenAddress>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub net_rx_bits: u64,
    pub net_tx_bits: u64,
    /// Raw inspect document, forwarded to the backend on container sync.
    pub inspect_json: String,
}

/// Output of the engine's `top` endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopBody {
    #[serde(default, rename = "Titles")]
    pub titles: Vec<String>,
    #[serde(default, rename = "Processes")]
    pub processes: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ListedContainer {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct Inspect {
    #[serde(default, rename = "Id")]
    id: String,
    #[serde(default, rename = "Name")]
    name: String,
    #[serde(default, rename = "Created")]
    created: String,
    #[serde(default, rename = "State")]
    state: InspectState,
    #[serde(default, rename = "NetworkSettings")]
    network_settings: NetworkSettings,
    #[serde(default, rename = "HostConfig")]
    host_config: HostConfig,
    #[serde(default, rename = "Config")]
    config: InspectConfig,
}

#[derive(Debug, Default, Deserialize)]
struct InspectState {
    #[serde(default, rename = "Status")]
    status: String,
    #[serde(default, rename = "Running")]
    running: bool,
    #[serde(default, rename = "StartedAt")]
    started_at: String,
    #[serde(default, rename = "FinishedAt")]
    finished_at: String,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkSettings {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
    #[serde(default, rename = "Ports")]
    ports: HashMap<String, Option<Vec<serde_json::Value>>>,
    #[serde(default, rename = "Networks")]
    networks: HashMap<String, Network>,
}

#[derive(Debug, Default, Deserialize)]
struct Network {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
}

#[derive(Debug, Default, Deserialize)]
struct HostConfig {
    #[serde(default, rename = "PortBindings")]
    port_bindings: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectConfig {
    #[serde(default, rename = "ExposedPorts")]
    exposed_ports: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Stats {
    #[serde(default)]
    blkio_stats: BlkioStats,
    #[serde(default)]
    networks: HashMap<String, NetworkStats>,
}

#[derive(Debug, Default, Deserialize)]
struct BlkioStats {
    #[serde(default)]
    io_service_bytes_recursive: Vec<BlkioEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct BlkioEntry {
    #[serde(default)]
    op: String,
    #[serde(default)]
    value: u64,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkStats {
    #[serde(default)]
    rx_bytes: u64,
    #[serde(default)]
    tx_bytes: u64,
}

/// Engine timestamps use `0001-01-01T00:00:00Z` for "never".
fn parse_engine_time(raw: &str) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw).ok()?;
    if parsed.year() <= 1 {
        return None;
    }
    Some(parsed.with_timezone(&Utc))
}

/// Split a port-map key like `"6379/tcp"`.
fn parse_port_key(key: &str) -> Option<(u16, SocketKind)> {
    let (port, proto) = key.split_once('/')?;
    let port: u16 = port.parse().ok()?;
    let kind = match proto {
        "tcp" => SocketKind::Tcp,
        "udp" => SocketKind::Udp,
        _ => return None,
    };
    Some((port, kind))
}

/// Primary IP and listening endpoints from an inspect document.
///
/// Port keys are read from `NetworkSettings.Ports`, falling back to
/// `HostConfig.PortBindings` then `Config.ExposedPorts` for the schemas
/// older engine versions produce.
fn network_info_from_inspect(inspect: &Inspect) -> (String, Vec<ListenAddress>) {
    let mut ip = inspect.network_settings.ip_address.clone();
    if ip.is_empty() {
        ip = inspect
            .network_settings
            .networks
            .values()
            .map(|n| n.ip_address.clone())
            .find(|addr| !addr.is_empty())
            .unwrap_or_default();
    }

    let mut keys: Vec<&String> = inspect.network_settings.ports.keys().collect();
    if keys.is_empty() {
        keys = inspect.host_config.port_bindings.keys().collect();
    }
    if keys.is_empty() {
        keys = inspect.config.exposed_ports.keys().collect();
    }
    keys.sort();

    let addresses = keys
        .into_iter()
        .filter_map(|key| parse_port_key(key))
        .map(|(port, network)| ListenAddress {
            network,
            address: ip.clone(),
            port,
        })
        .collect();
    (ip, addresses)
}

fn container_from_inspect(inspect: &Inspect, raw: &str) -> Container {
    let (ip_address, listen_addresses) = network_info_from_inspect(inspect);
    Container {
        id: inspect.id.clone(),
        name: inspect.name.trim_start_matches('/').to_string(),
        state: inspect.state.status.clone(),
        running: inspect.state.running,
        ip_address,
        listen_addresses,
        created_at: parse_engine_time(&inspect.created),
        started_at: parse_engine_time(&inspect.state.started_at),
        finished_at: parse_engine_time(&inspect.state.finished_at),
        io_read_bytes: 0,
        io_write_bytes: 0,
        net_rx_bits: 0,
        net_tx_bits: 0,
        inspect_json: raw.to_string(),
    }
}

fn apply_stats(container: &mut Container, stats: &Stats) {
    for entry in &stats.blkio_stats.io_service_bytes_recursive {
        match entry.op.as_str() {
            "Read" | "read" => container.io_read_bytes += entry.value,
            "Write" | "write" => container.io_write_bytes += entry.value,
            _ => {}
        }
    }
    for net in stats.networks.values() {
        container.net_rx_bits += net.rx_bytes * 8;
        container.net_tx_bits += net.tx_bytes * 8;
    }
}

struct Inner {
    containers: HashMap<String, Container>,
    last_update: Option<Instant>,
}

/// Container provider caching the engine inventory under its own lock.
pub struct ContainerProvider {
    socket_path: PathBuf,
    inner: Mutex<Inner>,
    fact_cache: StdMutex<HashMap<String, String>>,
}

impl ContainerProvider {
    pub fn new(socket_path: impl Into<PathBuf>) -> ContainerProvider {
        ContainerProvider {
            socket_path: socket_path.into(),
            inner: Mutex::new(Inner {
                containers: HashMap::new(),
                last_update: None,
            }),
            fact_cache: StdMutex::new(HashMap::new()),
        }
    }

    async fn engine_get(&self, path: &str) -> Result<Bytes> {
        let fut = async {
            let stream = UnixStream::connect(&self.socket_path)
                .await
                .context("connect to container engine socket")?;
            let io = TokioIo::new(stream);
            let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await?;
            tokio::spawn(async move {
                let _ = connection.await;
            });
            let request = Request::builder()
                .uri(path)
                .header(hyper::header::HOST, "localhost")
                .body(Empty::<Bytes>::new())?;
            let response = sender.send_request(request).await?;
            if !response.status().is_success() {
                return Err(anyhow!("engine returned {} for {}", response.status(), path));
            }
            Ok(response.into_body().collect().await?.to_bytes())
        };
        tokio::time::timeout(ENGINE_TIMEOUT, fut)
            .await
            .map_err(|_| anyhow!("engine request timed out: {path}"))?
    }

    /// True when the engine socket answers a ping.
    pub async fn has_connection(&self) -> bool {
        self.engine_get("/_ping").await.is_ok()
    }

    /// Known containers, refreshed when older than `max_age`. Stopped
    /// containers are filtered out unless `include_stopped`.
    pub async fn containers(
        &self,
        max_age: Duration,
        include_stopped: bool,
    ) -> Result<Vec<Container>> {
        let mut inner = self.inner.lock().await;
        let stale = match inner.last_update {
            Some(at) => at.elapsed() > max_age,
            None => true,
        };
        if stale {
            let containers = self.fetch_containers().await?;
            inner.containers = containers;
            inner.last_update = Some(Instant::now());
            self.update_fact_cache(&inner.containers);
        }
        Ok(inner
            .containers
            .values()
            .filter(|c| include_stopped || c.running)
            .cloned()
            .collect())
    }

    async fn fetch_containers(&self) -> Result<HashMap<String, Container>> {
        let body = self.engine_get("/containers/json?all=true").await?;
        let listed: Vec<ListedContainer> = serde_json::from_slice(&body)?;

        let mut containers = HashMap::with_capacity(listed.len());
        for entry in listed {
            let raw = match self.engine_get(&format!("/containers/{}/json", entry.id)).await {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::debug!(container = %entry.id, error = %err, "inspect failed, skipping");
                    continue;
                }
            };
            let inspect: Inspect = match serde_json::from_slice(&raw) {
                Ok(inspect) => inspect,
                Err(err) => {
                    tracing::debug!(container = %entry.id, error = %err, "undecodable inspect, skipping");
                    continue;
                }
            };
            let mut container =
                container_from_inspect(&inspect, &String::from_utf8_lossy(&raw));
            if container.running {
                if let Ok(raw) = self
                    .engine_get(&format!("/containers/{}/stats?stream=false", entry.id))
                    .await
                {
                    if let Ok(stats) = serde_json::from_slice::<Stats>(&raw) {
                        apply_stats(&mut container, &stats);
                    }
                }
            }
            containers.insert(container.id.clone(), container);
        }
        Ok(containers)
    }

    fn update_fact_cache(&self, containers: &HashMap<String, Container>) {
        let mut cache = self.fact_cache.lock().unwrap();
        cache.insert("container_runtime".to_string(), "docker".to_string());
        cache.insert(
            "containers_count".to_string(),
            containers.len().to_string(),
        );
        cache.insert(
            "containers_running_count".to_string(),
            containers.values().filter(|c| c.running).count().to_string(),
        );
    }

    /// Facts contributed by this provider, from the last refresh. Safe to
    /// call synchronously from the fact provider's callback.
    pub fn fact_snapshot(&self) -> HashMap<String, String> {
        self.fact_cache.lock().unwrap().clone()
    }

    /// Cached primary IP and listen addresses for a container.
    pub async fn network_info(&self, container_id: &str) -> Option<(String, Vec<ListenAddress>)> {
        let inner = self.inner.lock().await;
        inner
            .containers
            .get(container_id)
            .map(|c| (c.ip_address.clone(), c.listen_addresses.clone()))
    }

    /// `{container id -> display name}` for cgroup attribution.
    pub async fn container_id_to_name(
        &self,
        max_age: Duration,
    ) -> Result<HashMap<String, String>> {
        let containers = self.containers(max_age, true).await?;
        Ok(containers
            .into_iter()
            .map(|c| (c.id, c.name))
            .collect())
    }

    /// `top` output for a container: default and `waux` variants, the
    /// second completing columns the first omits.
    pub async fn top(&self, container_id: &str) -> Result<(TopBody, TopBody)> {
        let plain = self
            .engine_get(&format!("/containers/{container_id}/top"))
            .await?;
        let waux = self
            .engine_get(&format!("/containers/{container_id}/top?ps_args=waux"))
            .await?;
        Ok((
            serde_json::from_slice(&plain)?,
            serde_json::from_slice(&waux)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_info_current_schema() {
        let raw = r#"{
            "Id": "5b8f834129310",
            "Name": "/redis-cache",
            "Created": "2023-04-02T10:00:00Z",
            "State": {"Status": "running", "Running": true, "StartedAt": "2023-04-02T10:00:01Z", "FinishedAt": "0001-01-01T00:00:00Z"},
            "NetworkSettings": {
                "IPAddress": "172.17.0.49",
                "Ports": {"6379/tcp": null}
            }
        }"#;
        let inspect: Inspect = serde_json::from_str(raw).unwrap();
        let container = container_from_inspect(&inspect, raw);
        assert_eq!(container.name, "redis-cache");
        assert_eq!(container.ip_address, "172.17.0.49");
        assert_eq!(
            container.listen_addresses,
            vec![ListenAddress::tcp("172.17.0.49", 6379)]
        );
        assert!(container.started_at.is_some());
        assert!(container.finished_at.is_none());
    }

    #[test]
    fn network_info_ip_from_networks_map() {
        let raw = r#"{
            "Id": "abc",
            "Name": "/web",
            "State": {"Running": true},
            "NetworkSettings": {
                "IPAddress": "",
                "Networks": {"bridge": {"IPAddress": "172.18.0.2"}},
                "Ports": {"80/tcp": null, "443/tcp": null}
            }
        }"#;
        let inspect: Inspect = serde_json::from_str(raw).unwrap();
        let (ip, addresses) = network_info_from_inspect(&inspect);
        assert_eq!(ip, "172.18.0.2");
        assert_eq!(
            addresses,
            vec![
                ListenAddress::tcp("172.18.0.2", 443),
                ListenAddress::tcp("172.18.0.2", 80),
            ]
        );
    }

    #[test]
    fn network_info_falls_back_to_exposed_ports() {
        let raw = r#"{
            "Id": "abc",
            "Name": "/old",
            "State": {"Running": true},
            "NetworkSettings": {"IPAddress": "172.17.0.3"},
            "Config": {"ExposedPorts": {"11211/tcp": {}, "9/udp": {}}}
        }"#;
        let inspect: Inspect = serde_json::from_str(raw).unwrap();
        let (_, addresses) = network_info_from_inspect(&inspect);
        assert_eq!(addresses.len(), 2);
        assert!(addresses
            .iter()
            .any(|a| a.network == SocketKind::Udp && a.port == 9));
        assert!(addresses
            .iter()
            .any(|a| a.network == SocketKind::Tcp && a.port == 11211));
    }

    #[test]
    fn stats_fill_counters() {
        let mut container = Container::default();
        let stats: Stats = serde_json::from_str(
            r#"{
                "blkio_stats": {"io_service_bytes_recursive": [
                    {"op": "Read", "value": 1024},
                    {"op": "Write", "value": 2048},
                    {"op": "Total", "value": 3072}
                ]},
                "networks": {"eth0": {"rx_bytes": 100, "tx_bytes": 200}}
            }"#,
        )
        .unwrap();
        apply_stats(&mut container, &stats);
        assert_eq!(container.io_read_bytes, 1024);
        assert_eq!(container.io_write_bytes, 2048);
        assert_eq!(container.net_rx_bits, 800);
        assert_eq!(container.net_tx_bits, 1600);
    }

    #[test]
    fn engine_zero_time_is_none() {
        assert!(parse_engine_time("0001-01-01T00:00:00Z").is_none());
        assert!(parse_engine_time("2023-04-02T10:00:00Z").is_some());
        assert!(parse_engine_time("garbage").is_none());
    }
}
