//! Process inventory.
//!
//! The merged process table starts from container-runtime `top` rows
//! (authoritative for container attribution), overlays the `/proc` lister
//! with a non-empty-wins field policy, then consults cgroups for processes
//! the runtime did not claim.

use crate::cgroup;
use crate::container::{ContainerProvider, TopBody};
use crate::proc_fs::{self, CpuTimes};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Margin excluding processes that raced the enumeration: creation time is
/// only accurate to one clock tick, keep twice that.
const STARTED_BEFORE_MARGIN: Duration = Duration::from_millis(20);

/// A process attributed to a container through its cgroup but younger than
/// this is withheld; the runtime may simply not list it yet.
const RACY_CREATION_SECS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessStatus {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    TracingStop,
    Dead,
    Zombie,
    Idle,
    #[default]
    #[serde(rename = "?")]
    Unknown,
}

impl ProcessStatus {
    /// Map the first character of a `ps` STAT column or `/proc` state field.
    pub fn from_ps_char(c: char) -> ProcessStatus {
        match c {
            'D' => ProcessStatus::DiskSleep,
            'R' => ProcessStatus::Running,
            'S' => ProcessStatus::Sleeping,
            'T' => ProcessStatus::Stopped,
            't' => ProcessStatus::TracingStop,
            'X' => ProcessStatus::Dead,
            'Z' => ProcessStatus::Zombie,
            'I' => ProcessStatus::Idle,
            _ => ProcessStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Sleeping => "sleeping",
            ProcessStatus::DiskSleep => "disk-sleep",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::TracingStop => "tracing-stop",
            ProcessStatus::Dead => "dead",
            ProcessStatus::Zombie => "zombie",
            ProcessStatus::Idle => "idle",
            ProcessStatus::Unknown => "?",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Process {
    pub pid: i32,
    pub ppid: i32,
    /// None when the source could not tell (CPU percent is then skipped).
    pub create_time: Option<DateTime<Utc>>,
    pub cmdline: Vec<String>,
    pub name: String,
    pub memory_rss_kb: u64,
    pub cpu_percent: f64,
    pub cpu_time: f64,
    pub status: ProcessStatus,
    pub username: String,
    pub executable: String,
    /// Empty for host processes.
    pub container_id: String,
    pub container_name: String,
}

impl Process {
    /// Overlay `other` onto `self`: non-empty fields of `other` win (empty
    /// string, zero count and unknown time are considered unset).
    pub fn merge_from(&mut self, other: &Process) {
        if other.ppid != 0 {
            self.ppid = other.ppid;
        }
        if other.create_time.is_some() {
            self.create_time = other.create_time;
        }
        if !other.cmdline.is_empty() {
            self.cmdline = other.cmdline.clone();
        }
        if !other.name.is_empty() {
            self.name = other.name.clone();
        }
        if other.memory_rss_kb != 0 {
            self.memory_rss_kb = other.memory_rss_kb;
        }
        if other.cpu_percent != 0.0 {
            self.cpu_percent = other.cpu_percent;
        }
        if other.cpu_time != 0.0 {
            self.cpu_time = other.cpu_time;
        }
        if other.status != ProcessStatus::Unknown {
            self.status = other.status;
        }
        if !other.username.is_empty() {
            self.username = other.username.clone();
        }
        if !other.executable.is_empty() {
            self.executable = other.executable.clone();
        }
        if !other.container_id.is_empty() {
            self.container_id = other.container_id.clone();
        }
        if !other.container_name.is_empty() {
            self.container_name = other.container_name.clone();
        }
    }
}

/// Decode `ps`-style cumulative CPU time.
pub fn ps_time_to_seconds(value: &str) -> Result<f64, String> {
    let err = || format!("unknown ps time format {value:?}");
    let parse = |s: &str| s.parse::<f64>().map_err(|_| err());

    match value.matches(':').count() {
        1 => {
            // MM:SS
            let (m, s) = value.split_once(':').ok_or_else(err)?;
            Ok(parse(m)? * 60.0 + parse(s)?)
        }
        2 if value.contains('-') => {
            // DD-HH:MM:SS
            let (d, rest) = value.split_once('-').ok_or_else(err)?;
            let parts: Vec<&str> = rest.split(':').collect();
            if parts.len() != 3 {
                return Err(err());
            }
            Ok(parse(d)? * 86400.0
                + parse(parts[0])? * 3600.0
                + parse(parts[1])? * 60.0
                + parse(parts[2])?)
        }
        2 => {
            // HH:MM:SS
            let parts: Vec<&str> = value.split(':').collect();
            Ok(parse(parts[0])? * 3600.0 + parse(parts[1])? * 60.0 + parse(parts[2])?)
        }
        _ if value.contains('h') => {
            // HHhMM
            let (h, m) = value.split_once('h').ok_or_else(err)?;
            Ok(parse(h)? * 3600.0 + parse(m)? * 60.0)
        }
        _ if value.contains('d') => {
            // DDdHH
            let (d, h) = value.split_once('d').ok_or_else(err)?;
            Ok(parse(d)? * 86400.0 + parse(h)? * 3600.0)
        }
        _ => Err(err()),
    }
}

/// Decode a container `top` body into processes attributed to `container_id`.
/// PID and CMD columns are required; everything else is best-effort.
pub fn decode_top(top: &TopBody, container_id: &str, container_name: &str) -> Vec<Process> {
    let index_of = |names: &[&str]| {
        top.titles
            .iter()
            .position(|t| names.contains(&t.as_str()))
    };
    let pid_idx = index_of(&["PID"]);
    let cmd_idx = index_of(&["CMD", "COMMAND"]);
    let (Some(pid_idx), Some(cmd_idx)) = (pid_idx, cmd_idx) else {
        return Vec::new();
    };
    let user_idx = index_of(&["UID", "USER"]);
    let cpu_idx = index_of(&["%CPU"]);
    let rss_idx = index_of(&["RSS"]);
    let time_idx = index_of(&["TIME"]);
    let stat_idx = index_of(&["STAT"]);
    let ppid_idx = index_of(&["PPID"]);

    let mut processes = Vec::new();
    for row in &top.processes {
        let Some(pid) = row.get(pid_idx).and_then(|v| v.parse::<i32>().ok()) else {
            continue;
        };
        let Some(cmd) = row.get(cmd_idx) else {
            continue;
        };
        let cmdline: Vec<String> = cmd.split(' ').map(str::to_string).collect();
        let name = Path::new(&cmdline[0])
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| cmdline[0].clone());

        let mut process = Process {
            pid,
            cmdline,
            name,
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
            ..Process::default()
        };
        if let Some(v) = user_idx.and_then(|i| row.get(i)) {
            process.username = v.clone();
        }
        if let Some(v) = cpu_idx.and_then(|i| row.get(i)).and_then(|v| v.parse().ok()) {
            process.cpu_percent = v;
        }
        if let Some(v) = rss_idx.and_then(|i| row.get(i)).and_then(|v| v.parse().ok()) {
            process.memory_rss_kb = v;
        }
        if let Some(v) = time_idx
            .and_then(|i| row.get(i))
            .and_then(|v| ps_time_to_seconds(v).ok())
        {
            process.cpu_time = v;
        }
        if let Some(c) = stat_idx
            .and_then(|i| row.get(i))
            .and_then(|v| v.chars().next())
        {
            process.status = ProcessStatus::from_ps_char(c);
        }
        if let Some(v) = ppid_idx.and_then(|i| row.get(i)).and_then(|v| v.parse().ok()) {
            process.ppid = v;
        }
        processes.push(process);
    }
    processes
}

/// Source of host processes; the production lister walks `/proc`.
pub trait ProcessLister: Send + Sync {
    fn processes(&self) -> Result<Vec<Process>>;
}

/// `/proc`-based process lister.
pub struct ProcLister {
    proc_root: PathBuf,
}

impl ProcLister {
    pub fn new(proc_root: impl Into<PathBuf>) -> ProcLister {
        ProcLister {
            proc_root: proc_root.into(),
        }
    }
}

impl ProcessLister for ProcLister {
    fn processes(&self) -> Result<Vec<Process>> {
        let boot_time = proc_fs::boot_time(&self.proc_root)?;
        let boot = Utc
            .timestamp_opt(boot_time, 0)
            .single()
            .unwrap_or_else(Utc::now);

        let mut processes = Vec::new();
        for entry in std::fs::read_dir(&self.proc_root)? {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
                continue;
            };
            if pid == 0 {
                continue;
            }
            // The process may vanish between readdir and the reads below;
            // partial reads drop the entry silently.
            let Ok(stat) = proc_fs::read_pid_stat(&self.proc_root, pid) else {
                continue;
            };
            let mut cmdline = proc_fs::read_cmdline(&self.proc_root, pid);
            if cmdline.is_empty() || cmdline[0].is_empty() {
                cmdline = vec![stat.comm.clone()];
            }
            let (rss_kb, uid) = proc_fs::read_pid_status(&self.proc_root, pid);
            let username = uid.map(proc_fs::username_for_uid).unwrap_or_default();
            let executable = std::fs::read_link(
                self.proc_root.join(pid.to_string()).join("exe"),
            )
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

            let create_time =
                boot + ChronoDuration::from_std(Duration::from_secs_f64(stat.start_after_boot))
                    .unwrap_or_else(|_| ChronoDuration::zero());

            processes.push(Process {
                pid,
                ppid: stat.ppid,
                create_time: Some(create_time),
                cmdline,
                name: stat.comm,
                memory_rss_kb: rss_kb,
                cpu_percent: 0.0,
                cpu_time: stat.cpu_time,
                status: ProcessStatus::from_ps_char(stat.state),
                username,
                executable,
                container_id: String::new(),
                container_name: String::new(),
            });
        }
        Ok(processes)
    }
}

/// Container runtime view of processes, as needed by the merge.
#[async_trait]
pub trait ContainerTops: Send + Sync {
    /// Processes claimed by running containers.
    async fn processes(&self) -> Result<Vec<Process>>;
    async fn container_id_to_name(&self, max_age: Duration) -> Result<HashMap<String, String>>;
    async fn has_connection(&self) -> bool;
}

#[async_trait]
impl ContainerTops for ContainerProvider {
    async fn processes(&self) -> Result<Vec<Process>> {
        let mut merged: HashMap<i32, Process> = HashMap::new();
        for container in self.containers(Duration::ZERO, false).await? {
            let (plain, waux) = match self.top(&container.id).await {
                Ok(tops) => tops,
                Err(err) => {
                    // The container may have stopped between list and top.
                    tracing::debug!(container = %container.id, error = %err, "top failed");
                    continue;
                }
            };
            for process in decode_top(&plain, &container.id, &container.name) {
                merged.insert(process.pid, process);
            }
            for process in decode_top(&waux, &container.id, &container.name) {
                merged
                    .entry(process.pid)
                    .and_modify(|existing| existing.merge_from(&process))
                    .or_insert(process);
            }
        }
        Ok(merged.into_values().collect())
    }

    async fn container_id_to_name(&self, max_age: Duration) -> Result<HashMap<String, String>> {
        ContainerProvider::container_id_to_name(self, max_age).await
    }

    async fn has_connection(&self) -> bool {
        ContainerProvider::has_connection(self).await
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CpuUsagePercent {
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    pub idle: f64,
    pub iowait: f64,
    pub guest: f64,
    pub guest_nice: f64,
    pub irq: f64,
    pub softirq: f64,
    pub steal: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryUsageKb {
    pub total: f64,
    pub used: f64,
    pub free: f64,
    pub buffers: f64,
    pub cached: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SwapUsageKb {
    pub total: f64,
    pub used: f64,
    pub free: f64,
}

/// A top-like snapshot of the whole system.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TopInfo {
    pub time: i64,
    pub uptime: u64,
    pub loads: [f64; 3],
    pub users: usize,
    pub processes: Vec<Process>,
    pub cpu: CpuUsagePercent,
    pub memory: MemoryUsageKb,
    pub swap: SwapUsageKb,
}

/// Merge container rows with host-lister rows.
///
/// Container rows seed the map (authoritative container attribution); host
/// rows overlay field-by-field. Host rows created after
/// `only_started_before` are excluded entirely.
pub fn merge_process_lists(
    container_rows: Vec<Process>,
    host_rows: Vec<Process>,
    only_started_before: DateTime<Utc>,
) -> HashMap<i32, Process> {
    let mut merged: HashMap<i32, Process> = HashMap::new();
    for process in container_rows {
        merged.insert(process.pid, process);
    }
    for process in host_rows {
        if let Some(created) = process.create_time {
            if created > only_started_before {
                continue;
            }
        }
        match merged.get_mut(&process.pid) {
            Some(existing) => existing.merge_from(&process),
            None => {
                merged.insert(process.pid, process);
            }
        }
    }
    merged
}

/// Attribute container-less processes through their cgroup file.
///
/// A cgroup pointing at a container the runtime knows applies that
/// attribution; a cgroup pointing at an unknown container drops the process
/// when it is younger than 3 s (the runtime may not list it yet).
pub fn apply_cgroup_attribution(
    processes: &mut HashMap<i32, Process>,
    id_to_name: &HashMap<String, String>,
    resolver: &dyn Fn(i32) -> String,
    now: DateTime<Utc>,
) {
    let pids: Vec<i32> = processes.keys().copied().collect();
    for pid in pids {
        let Some(process) = processes.get_mut(&pid) else {
            continue;
        };
        if !process.container_id.is_empty() {
            continue;
        }
        let candidate = resolver(pid);
        if candidate.is_empty() {
            continue;
        }
        if let Some(name) = id_to_name.get(&candidate) {
            tracing::debug!(
                pid,
                process = %process.name,
                container = %name,
                "attributed to container via cgroup"
            );
            process.container_id = candidate;
            process.container_name = name.clone();
        } else if process
            .create_time
            .is_some_and(|created| now - created < ChronoDuration::seconds(RACY_CREATION_SECS))
        {
            tracing::debug!(pid, process = %process.name, "withholding recently created container process");
            processes.remove(&pid);
        }
    }
}

/// Derive CPU percentages from the previous snapshot.
///
/// Processes present in both snapshots with a matching creation time use
/// the CPU-time delta over `elapsed`; newly observed processes with a known
/// creation time use their whole lifetime. Unknown creation time: skipped.
pub fn update_cpu_percent(
    processes: &mut HashMap<i32, Process>,
    previous: &HashMap<i32, Process>,
    elapsed: Duration,
    now: DateTime<Utc>,
) {
    for (pid, process) in processes.iter_mut() {
        match previous.get(pid) {
            Some(old) if old.create_time == process.create_time => {
                let delta_cpu = process.cpu_time - old.cpu_time;
                let delta_t = elapsed.as_secs_f64();
                if delta_cpu > 0.0 && delta_t > 0.0 {
                    process.cpu_percent = delta_cpu / delta_t * 100.0;
                }
            }
            _ => {
                if let Some(created) = process.create_time {
                    let delta_t = (now - created).to_std().unwrap_or_default().as_secs_f64();
                    if process.cpu_time > 0.0 && delta_t > 0.0 {
                        process.cpu_percent = process.cpu_time / delta_t * 100.0;
                    }
                }
            }
        }
    }
}

fn clamp_percent(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

struct Inner {
    processes: HashMap<i32, Process>,
    topinfo: TopInfo,
    last_cpu_times: CpuTimes,
    last_update: Option<(Instant, DateTime<Utc>)>,
}

/// Max-age-cached provider of the merged process table.
pub struct ProcessProvider {
    lister: Box<dyn ProcessLister>,
    container: Option<Arc<dyn ContainerTops>>,
    proc_root: PathBuf,
    utmp_path: PathBuf,
    inner: Mutex<Inner>,
}

impl ProcessProvider {
    pub fn new(container: Option<Arc<dyn ContainerTops>>) -> ProcessProvider {
        Self::with_roots(container, "/proc", "/var/run/utmp")
    }

    pub fn with_roots(
        container: Option<Arc<dyn ContainerTops>>,
        proc_root: impl Into<PathBuf>,
        utmp_path: impl Into<PathBuf>,
    ) -> ProcessProvider {
        let proc_root = proc_root.into();
        ProcessProvider {
            lister: Box::new(ProcLister::new(proc_root.clone())),
            container,
            proc_root,
            utmp_path: utmp_path.into(),
            inner: Mutex::new(Inner {
                processes: HashMap::new(),
                topinfo: TopInfo::default(),
                last_cpu_times: CpuTimes::default(),
                last_update: None,
            }),
        }
    }

    /// The merged `{pid -> process}` table, refreshed when older than
    /// `max_age`. CPU percent is left at zero for processes whose creation
    /// time is unknown; no fallback is attempted.
    pub async fn processes(&self, max_age: Duration) -> Result<HashMap<i32, Process>> {
        Ok(self.processes_with_time(max_age).await?.0)
    }

    /// Same as [`ProcessProvider::processes`], also returning when the
    /// snapshot was taken.
    pub async fn processes_with_time(
        &self,
        max_age: Duration,
    ) -> Result<(HashMap<i32, Process>, DateTime<Utc>)> {
        let mut inner = self.inner.lock().await;
        self.refresh_if_stale(&mut inner, max_age).await?;
        let at = inner.last_update.map(|(_, t)| t).unwrap_or_else(Utc::now);
        Ok((inner.processes.clone(), at))
    }

    /// The top-like system snapshot, refreshed with the process table.
    pub async fn top_info(&self, max_age: Duration) -> Result<TopInfo> {
        let mut inner = self.inner.lock().await;
        self.refresh_if_stale(&mut inner, max_age).await?;
        Ok(inner.topinfo.clone())
    }

    async fn refresh_if_stale(&self, inner: &mut Inner, max_age: Duration) -> Result<()> {
        let stale = match inner.last_update {
            Some((at, _)) => at.elapsed() > max_age,
            None => true,
        };
        if !stale {
            return Ok(());
        }
        self.update_processes(inner).await
    }

    async fn update_processes(&self, inner: &mut Inner) -> Result<()> {
        let started = Instant::now();
        let now = Utc::now();
        let only_started_before = now
            - ChronoDuration::from_std(STARTED_BEFORE_MARGIN).unwrap_or_else(|_| ChronoDuration::zero());

        let container_rows = match &self.container {
            Some(container) => match container.processes().await {
                Ok(rows) => rows,
                // An unreachable runtime degrades to host-only listing; a
                // reachable runtime failing mid-listing aborts the refresh.
                Err(err) if !container.has_connection().await => {
                    tracing::debug!(error = %err, "container runtime unreachable");
                    Vec::new()
                }
                Err(err) => return Err(err),
            },
            None => Vec::new(),
        };
        let host_rows = self.lister.processes()?;
        let mut merged = merge_process_lists(container_rows, host_rows, only_started_before);

        if let Some(container) = &self.container {
            if let Ok(id_to_name) = container.container_id_to_name(Duration::from_secs(10)).await {
                let proc_root = self.proc_root.clone();
                apply_cgroup_attribution(
                    &mut merged,
                    &id_to_name,
                    &|pid| cgroup::container_id_for_pid(&proc_root, pid),
                    now,
                );
            }
        }

        if let Some((at, _)) = inner.last_update {
            update_cpu_percent(&mut merged, &inner.processes, at.elapsed(), now);
        } else {
            update_cpu_percent(&mut merged, &HashMap::new(), Duration::ZERO, now);
        }

        let mut topinfo = self.base_topinfo(&mut inner.last_cpu_times)?;
        topinfo.time = now.timestamp();
        topinfo.processes = merged.values().cloned().collect();

        inner.topinfo = topinfo;
        inner.processes = merged;
        inner.last_update = Some((Instant::now(), now));
        tracing::debug!(elapsed = ?started.elapsed(), count = inner.processes.len(), "process table refreshed");
        Ok(())
    }

    fn base_topinfo(&self, last_cpu_times: &mut CpuTimes) -> Result<TopInfo> {
        let mut topinfo = TopInfo {
            uptime: proc_fs::read_uptime(&self.proc_root)? as u64,
            loads: proc_fs::read_loadavg(&self.proc_root)?,
            users: proc_fs::logged_in_users(&self.utmp_path),
            ..TopInfo::default()
        };

        let mem = proc_fs::read_meminfo(&self.proc_root)?;
        topinfo.memory = MemoryUsageKb {
            total: mem.total_kb,
            used: mem.total_kb - mem.free_kb - mem.buffers_kb - mem.cached_kb,
            free: mem.free_kb,
            buffers: mem.buffers_kb,
            cached: mem.cached_kb,
        };
        topinfo.swap = SwapUsageKb {
            total: mem.swap_total_kb,
            used: mem.swap_total_kb - mem.swap_free_kb,
            free: mem.swap_free_kb,
        };

        let cpu_times = proc_fs::read_cpu_times(&self.proc_root)?;
        let delta = cpu_times.total() - last_cpu_times.total();
        if delta > 0.0 {
            let pct = |current: f64, last: f64| clamp_percent((current - last) / delta * 100.0);
            topinfo.cpu = CpuUsagePercent {
                user: pct(cpu_times.user, last_cpu_times.user),
                nice: pct(cpu_times.nice, last_cpu_times.nice),
                system: pct(cpu_times.system, last_cpu_times.system),
                idle: pct(cpu_times.idle, last_cpu_times.idle),
                iowait: pct(cpu_times.iowait, last_cpu_times.iowait),
                guest: pct(cpu_times.guest, last_cpu_times.guest),
                guest_nice: pct(cpu_times.guest_nice, last_cpu_times.guest_nice),
                irq: pct(cpu_times.irq, last_cpu_times.irq),
                softirq: pct(cpu_times.softirq, last_cpu_times.softirq),
                steal: pct(cpu_times.steal, last_cpu_times.steal),
            };
        }
        *last_cpu_times = cpu_times;
        Ok(topinfo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn top_fixture() -> TopBody {
        TopBody {
            titles: vec![
                "UID".into(),
                "PID".into(),
                "PPID".into(),
                "C".into(),
                "STIME".into(),
                "TTY".into(),
                "TIME".into(),
                "CMD".into(),
            ],
            processes: vec![vec![
                "999".into(),
                "5000".into(),
                "1".into(),
                "0".into(),
                "10:00".into(),
                "?".into(),
                "00:01:05".into(),
                "redis-server *:6379".into(),
            ]],
        }
    }

    #[test]
    fn ps_time_formats() {
        assert_eq!(ps_time_to_seconds("01:05").unwrap(), 65.0);
        assert_eq!(ps_time_to_seconds("00:01:05").unwrap(), 65.0);
        assert_eq!(ps_time_to_seconds("2-01:00:00").unwrap(), 176_400.0);
        assert_eq!(ps_time_to_seconds("3h05").unwrap(), 11_100.0);
        assert_eq!(ps_time_to_seconds("2d03").unwrap(), 183_600.0);
        assert!(ps_time_to_seconds("bogus").is_err());
    }

    #[test]
    fn ps_status_chars() {
        assert_eq!(ProcessStatus::from_ps_char('S'), ProcessStatus::Sleeping);
        assert_eq!(ProcessStatus::from_ps_char('D'), ProcessStatus::DiskSleep);
        assert_eq!(ProcessStatus::from_ps_char('t'), ProcessStatus::TracingStop);
        assert_eq!(ProcessStatus::from_ps_char('Z'), ProcessStatus::Zombie);
        assert_eq!(ProcessStatus::from_ps_char('q'), ProcessStatus::Unknown);
    }

    #[test]
    fn decode_top_maps_columns() {
        let processes = decode_top(&top_fixture(), "5b8f83412931", "redis-cache");
        assert_eq!(processes.len(), 1);
        let p = &processes[0];
        assert_eq!(p.pid, 5000);
        assert_eq!(p.ppid, 1);
        assert_eq!(p.username, "999");
        assert_eq!(p.cpu_time, 65.0);
        assert_eq!(p.name, "redis-server *:6379");
        assert_eq!(p.container_id, "5b8f83412931");
        assert_eq!(p.container_name, "redis-cache");
    }

    #[test]
    fn decode_top_requires_pid_and_cmd() {
        let top = TopBody {
            titles: vec!["USER".into(), "TIME".into()],
            processes: vec![vec!["root".into(), "00:01".into()]],
        };
        assert!(decode_top(&top, "x", "y").is_empty());
    }

    #[test]
    fn merge_is_idempotent_and_container_wins_attribution() {
        let now = Utc::now();
        let container_rows = vec![Process {
            pid: 5000,
            container_id: "5b8f83412931".into(),
            container_name: "redis-cache".into(),
            cmdline: vec!["redis-server *:6379".into()],
            name: "redis-server *:6379".into(),
            ..Process::default()
        }];
        let host_rows = vec![Process {
            pid: 5000,
            ppid: 1,
            create_time: Some(now - ChronoDuration::seconds(60)),
            cmdline: vec!["redis-server".into(), "*:6379".into()],
            name: "redis-server".into(),
            memory_rss_kb: 2048,
            cpu_time: 12.5,
            status: ProcessStatus::Sleeping,
            username: "redis".into(),
            ..Process::default()
        }];

        let merged1 = merge_process_lists(
            container_rows.clone(),
            host_rows.clone(),
            now,
        );
        let merged2 = merge_process_lists(container_rows, host_rows, now);

        let p = merged1.get(&5000).unwrap();
        assert_eq!(p.container_id, "5b8f83412931");
        assert_eq!(p.username, "redis");
        assert_eq!(p.memory_rss_kb, 2048);
        assert_eq!(p.status, ProcessStatus::Sleeping);
        assert_eq!(
            format!("{:?}", merged1.get(&5000)),
            format!("{:?}", merged2.get(&5000))
        );
    }

    #[test]
    fn merge_excludes_racy_starts() {
        let now = Utc::now();
        let host_rows = vec![Process {
            pid: 77,
            create_time: Some(now + ChronoDuration::milliseconds(5)),
            ..Process::default()
        }];
        let merged = merge_process_lists(Vec::new(), host_rows, now);
        assert!(merged.is_empty());
    }

    #[test]
    fn cgroup_attribution_known_and_racy() {
        let now = Utc::now();
        let mut processes = HashMap::new();
        processes.insert(
            10,
            Process {
                pid: 10,
                create_time: Some(now - ChronoDuration::seconds(60)),
                ..Process::default()
            },
        );
        processes.insert(
            11,
            Process {
                pid: 11,
                create_time: Some(now - ChronoDuration::seconds(1)),
                ..Process::default()
            },
        );
        processes.insert(
            12,
            Process {
                pid: 12,
                create_time: Some(now - ChronoDuration::seconds(60)),
                ..Process::default()
            },
        );

        let mut id_to_name = HashMap::new();
        id_to_name.insert("known".to_string(), "web".to_string());
        let resolver = |pid: i32| match pid {
            10 => "known".to_string(),
            11 => "unknown".to_string(),
            _ => String::new(),
        };

        apply_cgroup_attribution(&mut processes, &id_to_name, &resolver, now);

        assert_eq!(processes.get(&10).unwrap().container_name, "web");
        // Young process in an unknown container is withheld.
        assert!(!processes.contains_key(&11));
        // Host process untouched.
        assert!(processes.get(&12).unwrap().container_id.is_empty());
    }

    #[test]
    fn cgroup_unknown_but_old_process_is_kept() {
        let now = Utc::now();
        let mut processes = HashMap::new();
        processes.insert(
            20,
            Process {
                pid: 20,
                create_time: Some(now - ChronoDuration::seconds(60)),
                ..Process::default()
            },
        );
        let resolver = |_: i32| "unknown".to_string();
        apply_cgroup_attribution(&mut processes, &HashMap::new(), &resolver, now);
        assert!(processes.contains_key(&20));
    }

    #[test]
    fn cpu_percent_from_delta() {
        let now = Utc::now();
        let created = Some(now - ChronoDuration::seconds(100));
        let mut previous = HashMap::new();
        previous.insert(
            1,
            Process {
                pid: 1,
                create_time: created,
                cpu_time: 10.0,
                ..Process::default()
            },
        );
        let mut current = HashMap::new();
        current.insert(
            1,
            Process {
                pid: 1,
                create_time: created,
                cpu_time: 15.0,
                ..Process::default()
            },
        );
        update_cpu_percent(&mut current, &previous, Duration::from_secs(10), now);
        assert!((current.get(&1).unwrap().cpu_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_new_process_uses_lifetime() {
        let now = Utc::now();
        let mut current = HashMap::new();
        current.insert(
            2,
            Process {
                pid: 2,
                create_time: Some(now - ChronoDuration::seconds(50)),
                cpu_time: 5.0,
                ..Process::default()
            },
        );
        update_cpu_percent(&mut current, &HashMap::new(), Duration::from_secs(10), now);
        assert!((current.get(&2).unwrap().cpu_percent - 10.0).abs() < 0.5);
    }

    #[test]
    fn cpu_percent_skipped_without_create_time() {
        let now = Utc::now();
        let mut current = HashMap::new();
        current.insert(
            3,
            Process {
                pid: 3,
                create_time: None,
                cpu_time: 5.0,
                ..Process::default()
            },
        );
        update_cpu_percent(&mut current, &HashMap::new(), Duration::from_secs(10), now);
        assert_eq!(current.get(&3).unwrap().cpu_percent, 0.0);
    }
}
