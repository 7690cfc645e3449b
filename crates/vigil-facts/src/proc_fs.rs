//! Low-level `/proc` readers shared by the process and system providers.

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

/// Clock ticks per second, needed to convert `stat` jiffies to seconds.
pub static CLK_TCK: Lazy<f64> = Lazy::new(|| {
    #[cfg(unix)]
    {
        // SAFETY: sysconf(_SC_CLK_TCK) has no preconditions.
        let tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if tck > 0 {
            return tck as f64;
        }
    }
    100.0
});

/// Fields of `/proc/<pid>/stat` the inventory needs.
#[derive(Debug, Clone, Default)]
pub struct PidStat {
    pub comm: String,
    pub state: char,
    pub ppid: i32,
    /// user + system CPU time in seconds.
    pub cpu_time: f64,
    /// Process start, in seconds after boot (sub-tick precision).
    pub start_after_boot: f64,
}

/// Parse a `/proc/<pid>/stat` line. The command name may itself contain
/// spaces and parentheses, so fields are split after the last `)`.
pub fn parse_pid_stat(content: &str) -> Result<PidStat> {
    let open = content.find('(').ok_or_else(|| anyhow!("missing comm"))?;
    let close = content.rfind(')').ok_or_else(|| anyhow!("missing comm"))?;
    let comm = content[open + 1..close].to_string();
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    // rest[0] is the state; utime/stime are fields 14/15 of the full line
    // (rest[11]/rest[12]), starttime is field 22 (rest[19]).
    if rest.len() <= 19 {
        return Err(anyhow!("truncated stat line"));
    }
    let state = rest[0].chars().next().unwrap_or('?');
    let ppid: i32 = rest[1].parse().context("ppid")?;
    let utime: f64 = rest[11].parse().unwrap_or(0.0);
    let stime: f64 = rest[12].parse().unwrap_or(0.0);
    let starttime: f64 = rest[19].parse().unwrap_or(0.0);
    Ok(PidStat {
        comm,
        state,
        ppid,
        cpu_time: (utime + stime) / *CLK_TCK,
        start_after_boot: starttime / *CLK_TCK,
    })
}

pub fn read_pid_stat(proc_root: &Path, pid: i32) -> Result<PidStat> {
    let content = fs::read_to_string(proc_root.join(pid.to_string()).join("stat"))?;
    parse_pid_stat(&content)
}

/// Read `/proc/<pid>/cmdline`: NUL-separated, with embedded empty arguments
/// stripped (processes rewriting their name leave runs of NULs behind).
pub fn read_cmdline(proc_root: &Path, pid: i32) -> Vec<String> {
    let Ok(raw) = fs::read(proc_root.join(pid.to_string()).join("cmdline")) else {
        return Vec::new();
    };
    raw.split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .filter_map(|part| std::str::from_utf8(part).ok())
        .map(str::to_string)
        .collect()
}

/// VmRSS (KiB) and real uid from `/proc/<pid>/status`.
pub fn read_pid_status(proc_root: &Path, pid: i32) -> (u64, Option<u32>) {
    let Ok(content) = fs::read_to_string(proc_root.join(pid.to_string()).join("status")) else {
        return (0, None);
    };
    let mut rss_kb = 0;
    let mut uid = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss_kb = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("Uid:") {
            uid = rest.split_whitespace().next().and_then(|v| v.parse().ok());
        }
    }
    (rss_kb, uid)
}

/// Boot time (unix seconds) from the `btime` line of `/proc/stat`.
pub fn boot_time(proc_root: &Path) -> Result<i64> {
    let content = fs::read_to_string(proc_root.join("stat"))?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            return rest.trim().parse().context("btime");
        }
    }
    Err(anyhow!("no btime in /proc/stat"))
}

/// Aggregate CPU times (first `cpu` line of `/proc/stat`), in ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    pub idle: f64,
    pub iowait: f64,
    pub irq: f64,
    pub softirq: f64,
    pub steal: f64,
    pub guest: f64,
    pub guest_nice: f64,
}

impl CpuTimes {
    pub fn total(&self) -> f64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }
}

pub fn read_cpu_times(proc_root: &Path) -> Result<CpuTimes> {
    let content = fs::read_to_string(proc_root.join("stat"))?;
    let line = content
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| anyhow!("no cpu line in /proc/stat"))?;
    let fields: Vec<f64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse().unwrap_or(0.0))
        .collect();
    let get = |i: usize| fields.get(i).copied().unwrap_or(0.0);
    Ok(CpuTimes {
        user: get(0),
        nice: get(1),
        system: get(2),
        idle: get(3),
        iowait: get(4),
        irq: get(5),
        softirq: get(6),
        steal: get(7),
        guest: get(8),
        guest_nice: get(9),
    })
}

/// 1/5/15-minute load averages from `/proc/loadavg`.
pub fn read_loadavg(proc_root: &Path) -> Result<[f64; 3]> {
    let content = fs::read_to_string(proc_root.join("loadavg"))?;
    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(anyhow!("short loadavg"));
    }
    Ok([
        parts[0].parse().context("load1")?,
        parts[1].parse().context("load5")?,
        parts[2].parse().context("load15")?,
    ])
}

/// System uptime in seconds from `/proc/uptime`.
pub fn read_uptime(proc_root: &Path) -> Result<f64> {
    let content = fs::read_to_string(proc_root.join("uptime"))?;
    content
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("empty uptime"))?
        .parse()
        .context("uptime")
}

/// Selected `/proc/meminfo` values, in KiB.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemInfo {
    pub total_kb: f64,
    pub free_kb: f64,
    pub buffers_kb: f64,
    pub cached_kb: f64,
    pub swap_total_kb: f64,
    pub swap_free_kb: f64,
}

pub fn read_meminfo(proc_root: &Path) -> Result<MemInfo> {
    let content = fs::read_to_string(proc_root.join("meminfo"))?;
    let mut info = MemInfo::default();
    for line in content.lines() {
        let mut it = line.split_whitespace();
        let (Some(key), Some(value)) = (it.next(), it.next()) else {
            continue;
        };
        let value: f64 = value.parse().unwrap_or(0.0);
        match key {
            "MemTotal:" => info.total_kb = value,
            "MemFree:" => info.free_kb = value,
            "Buffers:" => info.buffers_kb = value,
            "Cached:" => info.cached_kb = value,
            "SwapTotal:" => info.swap_total_kb = value,
            "SwapFree:" => info.swap_free_kb = value,
            _ => {}
        }
    }
    Ok(info)
}

static PASSWD_CACHE: Lazy<Mutex<Option<HashMap<u32, String>>>> = Lazy::new(|| Mutex::new(None));

/// Resolve a uid to a username through `/etc/passwd`, parsed once. Unknown
/// uids come back as their decimal form.
pub fn username_for_uid(uid: u32) -> String {
    let mut cache = PASSWD_CACHE.lock().unwrap();
    let map = cache.get_or_insert_with(|| {
        let mut map = HashMap::new();
        if let Ok(content) = fs::read_to_string("/etc/passwd") {
            for line in content.lines() {
                let fields: Vec<&str> = line.split(':').collect();
                if fields.len() >= 3 {
                    if let Ok(uid) = fields[2].parse::<u32>() {
                        map.insert(uid, fields[0].to_string());
                    }
                }
            }
        }
        map
    });
    map.get(&uid).cloned().unwrap_or_else(|| uid.to_string())
}

/// Count of logged-in users from the utmp database (USER_PROCESS records).
pub fn logged_in_users(utmp_path: &Path) -> usize {
    const UTMP_RECORD_SIZE: usize = 384;
    const USER_PROCESS: i32 = 7;

    let Ok(raw) = fs::read(utmp_path) else {
        return 0;
    };
    raw.chunks_exact(UTMP_RECORD_SIZE)
        .filter(|record| {
            let ty = i32::from_ne_bytes([record[0], record[1], record[2], record[3]]);
            ty == USER_PROCESS
        })
        .count()
}
