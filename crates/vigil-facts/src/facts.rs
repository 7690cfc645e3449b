//! Host facts: slowly changing attributes gathered from the filesystem,
//! completed by component callbacks and manual overrides.

use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type FactCallback = Arc<dyn Fn() -> HashMap<String, String> + Send + Sync>;

struct Inner {
    facts: HashMap<String, String>,
    last_update: Option<Instant>,
}

/// TTL-cached `{key -> value}` snapshot of host attributes.
pub struct FactProvider {
    proc_root: PathBuf,
    sys_root: PathBuf,
    etc_root: PathBuf,
    inner: Mutex<Inner>,
    manual: Mutex<HashMap<String, String>>,
    callbacks: Mutex<Vec<FactCallback>>,
}

impl FactProvider {
    pub fn new() -> FactProvider {
        Self::with_roots("/proc", "/sys", "/etc")
    }

    pub fn with_roots(
        proc_root: impl Into<PathBuf>,
        sys_root: impl Into<PathBuf>,
        etc_root: impl Into<PathBuf>,
    ) -> FactProvider {
        FactProvider {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
            etc_root: etc_root.into(),
            inner: Mutex::new(Inner {
                facts: HashMap::new(),
                last_update: None,
            }),
            manual: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback contributing additional facts on each refresh.
    pub fn add_callback(&self, callback: FactCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Set a fact manually; manual facts win over gathered ones.
    pub fn set_fact(&self, key: impl Into<String>, value: impl Into<String>) {
        self.manual.lock().unwrap().insert(key.into(), value.into());
    }

    /// The current fact snapshot, refreshed when older than `max_age`.
    pub fn facts(&self, max_age: Duration) -> HashMap<String, String> {
        let mut inner = self.inner.lock().unwrap();
        let stale = match inner.last_update {
            Some(at) => at.elapsed() > max_age,
            None => true,
        };
        if stale {
            inner.facts = self.gather();
            inner.last_update = Some(Instant::now());
        }
        inner.facts.clone()
    }

    fn gather(&self) -> HashMap<String, String> {
        let mut facts = HashMap::new();

        let hostname = self
            .read_trimmed(self.proc_root.join("sys/kernel/hostname"))
            .unwrap_or_default();
        facts.insert("hostname".to_string(), hostname.clone());

        let fqdn = if hostname.contains('.') {
            hostname.clone()
        } else {
            fs::read_to_string(self.etc_root.join("hosts"))
                .ok()
                .and_then(|hosts| fqdn_from_hosts(&hosts, &hostname))
                .unwrap_or_else(|| hostname.clone())
        };
        facts.insert("fqdn".to_string(), fqdn);

        if let Some(kernel) = self.read_trimmed(self.proc_root.join("sys/kernel/osrelease")) {
            let major: String = kernel.split('.').take(2).collect::<Vec<_>>().join(".");
            facts.insert("kernel".to_string(), "Linux".to_string());
            facts.insert("kernel_release".to_string(), kernel);
            facts.insert("kernel_major_version".to_string(), major);
        }

        if let Ok(content) = fs::read_to_string(self.etc_root.join("os-release")) {
            for (key, value) in parse_os_release(&content) {
                facts.insert(key, value);
            }
        }

        facts.insert(
            "architecture".to_string(),
            std::env::consts::ARCH.to_string(),
        );

        if let Ok(route) = fs::read_to_string(self.proc_root.join("net/route")) {
            if let Some(iface) = default_route_interface(&route) {
                facts.insert("primary_interface".to_string(), iface.clone());
                if let Some(mac) = self.read_trimmed(
                    self.sys_root.join("class/net").join(&iface).join("address"),
                ) {
                    facts.insert("primary_mac_address".to_string(), mac);
                }
            }
        }
        if let Some(address) = primary_address() {
            facts.insert("primary_address".to_string(), address);
        }

        facts.insert(
            "agent_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        facts.insert(
            "fact_updated_at".to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );

        let callbacks = self.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            for (key, value) in callback() {
                facts.insert(key, value);
            }
        }
        for (key, value) in self.manual.lock().unwrap().iter() {
            facts.insert(key.clone(), value.clone());
        }

        facts.retain(|_, value| !value.is_empty());
        facts
    }

    fn read_trimmed(&self, path: PathBuf) -> Option<String> {
        fs::read_to_string(path).ok().map(|s| s.trim().to_string())
    }
}

impl Default for FactProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// First FQDN-looking alias of `hostname` in an `/etc/hosts` document.
fn fqdn_from_hosts(hosts: &str, hostname: &str) -> Option<String> {
    if hostname.is_empty() {
        return None;
    }
    for line in hosts.lines() {
        let line = line.split('#').next().unwrap_or("");
        let names: Vec<&str> = line.split_whitespace().skip(1).collect();
        if names.iter().any(|n| *n == hostname) {
            if let Some(fqdn) = names.iter().find(|n| n.contains('.')) {
                return Some(fqdn.to_string());
            }
        }
    }
    None
}

/// `KEY=value` pairs of `/etc/os-release`, mapped to fact names.
fn parse_os_release(content: &str) -> Vec<(String, String)> {
    let mut facts = Vec::new();
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "NAME" => facts.push(("os_name".to_string(), value)),
            "VERSION_ID" => facts.push(("os_version".to_string(), value)),
            "PRETTY_NAME" => facts.push(("os_pretty_name".to_string(), value)),
            "ID" => facts.push(("os_id".to_string(), value)),
            _ => {}
        }
    }
    facts
}

/// Interface of the default route in `/proc/net/route`.
fn default_route_interface(content: &str) -> Option<String> {
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 2 && fields[1] == "00000000" {
            return Some(fields[0].to_string());
        }
    }
    None
}

/// Local address used to reach the outside, found by connecting a UDP
/// socket (no packet is sent).
fn primary_address() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_release_parsing() {
        let content = "NAME=\"Debian GNU/Linux\"\nVERSION_ID=\"12\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\n";
        let facts: HashMap<_, _> = parse_os_release(content).into_iter().collect();
        assert_eq!(facts.get("os_name").unwrap(), "Debian GNU/Linux");
        assert_eq!(facts.get("os_version").unwrap(), "12");
        assert_eq!(facts.get("os_id").unwrap(), "debian");
    }

    #[test]
    fn default_route_lookup() {
        let content = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
";
        assert_eq!(default_route_interface(content).unwrap(), "eth0");
        assert!(default_route_interface("Iface\tDestination\n").is_none());
    }

    #[test]
    fn fqdn_from_hosts_file() {
        let hosts = "127.0.0.1 localhost\n192.168.1.5 web-01.example.com web-01\n";
        assert_eq!(
            fqdn_from_hosts(hosts, "web-01").unwrap(),
            "web-01.example.com"
        );
        assert!(fqdn_from_hosts(hosts, "db-01").is_none());
    }

    #[test]
    fn manual_facts_and_callbacks_win() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("proc/sys/kernel")).unwrap();
        std::fs::write(dir.path().join("proc/sys/kernel/hostname"), "test-host\n").unwrap();

        let provider = FactProvider::with_roots(
            dir.path().join("proc"),
            dir.path().join("sys"),
            dir.path().join("etc"),
        );
        provider.add_callback(Arc::new(|| {
            let mut facts = HashMap::new();
            facts.insert("container_runtime".to_string(), "docker".to_string());
            facts
        }));
        provider.set_fact("installation_format", "manual");

        let facts = provider.facts(Duration::ZERO);
        assert_eq!(facts.get("hostname").unwrap(), "test-host");
        assert_eq!(facts.get("container_runtime").unwrap(), "docker");
        assert_eq!(facts.get("installation_format").unwrap(), "manual");
        assert!(facts.contains_key("fact_updated_at"));
    }

    #[test]
    fn cache_respects_max_age() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("proc/sys/kernel")).unwrap();
        std::fs::write(dir.path().join("proc/sys/kernel/hostname"), "a\n").unwrap();

        let provider = FactProvider::with_roots(
            dir.path().join("proc"),
            dir.path().join("sys"),
            dir.path().join("etc"),
        );
        let first = provider.facts(Duration::from_secs(3600));
        std::fs::write(dir.path().join("proc/sys/kernel/hostname"), "b\n").unwrap();

        // Within max-age: unchanged. Forced refresh: updated.
        let cached = provider.facts(Duration::from_secs(3600));
        assert_eq!(first.get("hostname"), cached.get("hostname"));
        let refreshed = provider.facts(Duration::ZERO);
        assert_eq!(refreshed.get("hostname").unwrap(), "b");
    }
}
