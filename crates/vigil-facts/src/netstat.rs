//! Listening-socket inventory.
//!
//! Two sources are merged: an optional snapshot file captured by a
//! root-privileged `netstat -tunap` run, and a live query of
//! `/proc/net/tcp*` restricted to LISTEN sockets (UDP sockets carry no
//! LISTEN state there and only ever come from the snapshot file).

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    Tcp,
    Udp,
    Unix,
}

impl SocketKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketKind::Tcp => "tcp",
            SocketKind::Udp => "udp",
            SocketKind::Unix => "unix",
        }
    }
}

impl std::fmt::Display for SocketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One address a process listens on. For `unix` sockets the path lives in
/// `address` and `port` is zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenAddress {
    pub network: SocketKind,
    pub address: String,
    pub port: u16,
}

impl ListenAddress {
    pub fn tcp(address: impl Into<String>, port: u16) -> Self {
        ListenAddress {
            network: SocketKind::Tcp,
            address: address.into(),
            port,
        }
    }

    /// `host:port` form used for dialing; the bare path for unix sockets.
    pub fn to_dial_string(&self) -> String {
        match self.network {
            SocketKind::Unix => self.address.clone(),
            _ => format!("{}:{}", self.address, self.port),
        }
    }
}

impl std::fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.network, self.to_dial_string())
    }
}

static NETSTAT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<protocol>udp6?|tcp6?)\s+\d+\s+\d+\s+(?P<address>[0-9a-f.:]+):(?P<port>\d+)\s+[0-9a-f.:*]+\s+(LISTEN)?\s+(?P<pid>\d+)/(?P<program>.*)$",
    )
    .unwrap()
});

static NETSTAT_UNIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<protocol>unix)\s+\d+\s+\[\s+(ACC |W |N )+\s*\]\s+(DGRAM|STREAM)\s+LISTENING\s+(\d+\s+)?(?P<pid>\d+)/(?P<program>.*)\s+(?P<address>.+)$",
    )
    .unwrap()
});

/// Add `(network, address, port)` to a listen-address list.
///
/// Applies the IPv6 projection (`::` to `0.0.0.0`, `::1` to `127.0.0.1`,
/// any other IPv6 dropped, `tcp6`/`udp6` collapsed) and deduplicates by
/// `(network, port)`, preferring addresses in `127.0.0.0/8`.
fn add_address(addresses: &mut Vec<ListenAddress>, network: &str, address: &str, port: u16) {
    let mut address = address.to_string();
    let kind = match network {
        "unix" => {
            addresses.push(ListenAddress {
                network: SocketKind::Unix,
                address,
                port: 0,
            });
            return;
        }
        "tcp" => SocketKind::Tcp,
        "udp" => SocketKind::Udp,
        "tcp6" | "udp6" => {
            match address.as_str() {
                "::" => address = "0.0.0.0".to_string(),
                "::1" => address = "127.0.0.1".to_string(),
                _ if address.contains(':') => return,
                _ => {}
            }
            if network == "tcp6" {
                SocketKind::Tcp
            } else {
                SocketKind::Udp
            }
        }
        _ => return,
    };

    let new_addr = ListenAddress {
        network: kind,
        address,
        port,
    };
    for existing in addresses.iter_mut() {
        if existing.network == new_addr.network && existing.port == new_addr.port {
            if new_addr.address.starts_with("127.") {
                *existing = new_addr;
            }
            return;
        }
    }
    addresses.push(new_addr);
}

fn decode_netstat_file(data: &str) -> HashMap<i32, Vec<ListenAddress>> {
    let mut result: HashMap<i32, Vec<ListenAddress>> = HashMap::new();
    for line in data.lines() {
        let (protocol, address, port, pid) = if let Some(c) = NETSTAT_RE.captures(line) {
            let Ok(port) = c["port"].parse::<u16>() else {
                continue;
            };
            let Ok(pid) = c["pid"].parse::<i32>() else {
                continue;
            };
            (
                c["protocol"].to_string(),
                c["address"].to_string(),
                port,
                pid,
            )
        } else if let Some(c) = NETSTAT_UNIX_RE.captures(line) {
            let Ok(pid) = c["pid"].parse::<i32>() else {
                continue;
            };
            (
                c["protocol"].to_string(),
                c["address"].to_string(),
                0,
                pid,
            )
        } else {
            continue;
        };
        add_address(result.entry(pid).or_default(), &protocol, &address, port);
    }
    result
}

const TCP_LISTEN_STATE: &str = "0A";

fn decode_inet_hex_v4(hex: &str) -> Option<Ipv4Addr> {
    let raw = u32::from_str_radix(hex, 16).ok()?;
    Some(Ipv4Addr::from(raw.to_le_bytes()))
}

fn decode_inet_hex_v6(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 {
        return None;
    }
    let mut bytes = [0u8; 16];
    for (i, chunk) in hex.as_bytes().chunks(8).enumerate() {
        let chunk = std::str::from_utf8(chunk).ok()?;
        let word = u32::from_str_radix(chunk, 16).ok()?;
        bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    Some(Ipv6Addr::from(bytes))
}

/// Parse one `/proc/net/tcp[6]` table, returning `(inode, address, port)`
/// for sockets in LISTEN state.
fn parse_proc_net_tcp(content: &str, v6: bool) -> Vec<(u64, String, u16)> {
    let mut out = Vec::new();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || fields[3] != TCP_LISTEN_STATE {
            continue;
        }
        let Some((addr_hex, port_hex)) = fields[1].split_once(':') else {
            continue;
        };
        let Ok(port) = u16::from_str_radix(port_hex, 16) else {
            continue;
        };
        let Ok(inode) = fields[9].parse::<u64>() else {
            continue;
        };
        let address = if v6 {
            match decode_inet_hex_v6(addr_hex) {
                Some(ip) => ip.to_string(),
                None => continue,
            }
        } else {
            match decode_inet_hex_v4(addr_hex) {
                Some(ip) => ip.to_string(),
                None => continue,
            }
        };
        out.push((inode, address, port));
    }
    out
}

/// Map socket inodes to owning PIDs by walking `/proc/<pid>/fd`.
fn socket_inode_to_pid(proc_root: &Path) -> HashMap<u64, i32> {
    let mut map = HashMap::new();
    let Ok(entries) = fs::read_dir(proc_root) else {
        return map;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            if let Some(inode) = target
                .strip_prefix("socket:[")
                .and_then(|rest| rest.strip_suffix(']'))
                .and_then(|inode| inode.parse::<u64>().ok())
            {
                map.insert(inode, pid);
            }
        }
    }
    map
}

struct Cached {
    netstat: HashMap<i32, Vec<ListenAddress>>,
    at: Instant,
}

/// Netstat provider merging the snapshot file with the live /proc query.
pub struct NetstatProvider {
    file_path: PathBuf,
    proc_root: PathBuf,
    cache: Mutex<Option<Cached>>,
}

impl NetstatProvider {
    pub fn new(file_path: impl Into<PathBuf>) -> NetstatProvider {
        NetstatProvider {
            file_path: file_path.into(),
            proc_root: PathBuf::from("/proc"),
            cache: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> NetstatProvider {
        self.proc_root = proc_root.into();
        self
    }

    /// Listening addresses per PID, refreshed when the cache is older than
    /// `max_age`. A missing snapshot file is not an error.
    pub fn netstat(&self, max_age: Duration) -> Result<HashMap<i32, Vec<ListenAddress>>> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(cached) = cache.as_ref() {
            if cached.at.elapsed() <= max_age {
                return Ok(cached.netstat.clone());
            }
        }

        let data = match fs::read_to_string(&self.file_path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        let mut netstat = decode_netstat_file(&data);

        let inode_to_pid = socket_inode_to_pid(&self.proc_root);
        for (file, v6) in [("net/tcp", false), ("net/tcp6", true)] {
            let Ok(content) = fs::read_to_string(self.proc_root.join(file)) else {
                continue;
            };
            let network = if v6 { "tcp6" } else { "tcp" };
            for (inode, address, port) in parse_proc_net_tcp(&content, v6) {
                let Some(&pid) = inode_to_pid.get(&inode) else {
                    continue;
                };
                add_address(netstat.entry(pid).or_default(), network, &address, port);
            }
        }

        *cache = Some(Cached {
            netstat: netstat.clone(),
            at: Instant::now(),
        });
        Ok(netstat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netstat_file_tcp_udp_and_unix() {
        let data = "\
Active Internet connections (servers and established)
Proto Recv-Q Send-Q Local Address           Foreign Address         State       PID/Program name
tcp        0      0 127.0.0.1:11211         0.0.0.0:*               LISTEN      1547/memcached
udp        0      0 0.0.0.0:53              0.0.0.0:*                           612/dnsmasq
unix  2      [ ACC ]     STREAM     LISTENING     17020    866/dockerd          /var/run/docker.sock
";
        let result = decode_netstat_file(data);
        assert_eq!(
            result.get(&1547).unwrap(),
            &vec![ListenAddress::tcp("127.0.0.1", 11211)]
        );
        assert_eq!(
            result.get(&612).unwrap(),
            &vec![ListenAddress {
                network: SocketKind::Udp,
                address: "0.0.0.0".to_string(),
                port: 53,
            }]
        );
        assert_eq!(
            result.get(&866).unwrap(),
            &vec![ListenAddress {
                network: SocketKind::Unix,
                address: "/var/run/docker.sock".to_string(),
                port: 0,
            }]
        );
    }

    #[test]
    fn ipv6_projection() {
        let mut addresses = Vec::new();
        add_address(&mut addresses, "tcp6", "::1", 5672);
        add_address(&mut addresses, "tcp6", "::", 80);
        add_address(&mut addresses, "tcp6", "fe80::1", 443);
        assert_eq!(
            addresses,
            vec![
                ListenAddress::tcp("127.0.0.1", 5672),
                ListenAddress::tcp("0.0.0.0", 80),
            ]
        );
    }

    #[test]
    fn dedup_prefers_loopback() {
        let mut addresses = Vec::new();
        add_address(&mut addresses, "tcp", "0.0.0.0", 11211);
        add_address(&mut addresses, "tcp", "127.0.0.1", 11211);
        assert_eq!(addresses, vec![ListenAddress::tcp("127.0.0.1", 11211)]);

        // Reversed order keeps the loopback address as well.
        let mut addresses = Vec::new();
        add_address(&mut addresses, "tcp", "127.0.0.1", 11211);
        add_address(&mut addresses, "tcp", "192.168.1.10", 11211);
        assert_eq!(addresses, vec![ListenAddress::tcp("127.0.0.1", 11211)]);
    }

    #[test]
    fn dedup_is_scoped_by_network() {
        let mut addresses = Vec::new();
        add_address(&mut addresses, "tcp", "0.0.0.0", 53);
        add_address(&mut addresses, "udp", "0.0.0.0", 53);
        assert_eq!(addresses.len(), 2);
    }

    #[test]
    fn proc_net_tcp_listen_decode() {
        let content = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:2BCB 00000000:0000 0A 00000000:00000000 00:00000000 00000000   111        0 17990 1 0000000000000000 100 0 0 10 0
   1: 00000000:1F90 00000000:0000 01 00000000:00000000 00:00000000 00000000  1000        0 22222 1 0000000000000000 100 0 0 10 0
";
        let sockets = parse_proc_net_tcp(content, false);
        assert_eq!(sockets, vec![(17990, "127.0.0.1".to_string(), 0x2BCB)]);
    }

    #[test]
    fn proc_net_tcp6_loopback_decode() {
        let content = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000001000000:1628 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000   111        0 1234 1 0000000000000000 100 0 0 10 0
";
        let sockets = parse_proc_net_tcp(content, true);
        assert_eq!(sockets, vec![(1234, "::1".to_string(), 0x1628)]);
    }

    #[cfg(unix)]
    #[test]
    fn live_query_maps_inode_to_pid() {
        let dir = tempfile::tempdir().unwrap();
        let proc_root = dir.path();
        std::fs::create_dir_all(proc_root.join("1547/fd")).unwrap();
        std::os::unix::fs::symlink("socket:[17990]", proc_root.join("1547/fd/3")).unwrap();
        std::fs::create_dir_all(proc_root.join("net")).unwrap();
        std::fs::write(
            proc_root.join("net/tcp"),
            "  sl  local_address rem_address   st tx rx tr tm re uid timeout inode\n   0: 0100007F:2BCB 00000000:0000 0A 00000000:00000000 00:00000000 00000000 111 0 17990 1\n",
        )
        .unwrap();

        let provider =
            NetstatProvider::new(proc_root.join("netstat.out")).with_proc_root(proc_root);
        let netstat = provider.netstat(Duration::ZERO).unwrap();
        assert_eq!(
            netstat.get(&1547).unwrap(),
            &vec![ListenAddress::tcp("127.0.0.1", 0x2BCB)]
        );
    }
}
