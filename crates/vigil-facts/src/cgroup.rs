//! Container attribution through `/proc/<pid>/cgroup`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

static CGROUP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\d+:[^:]*:(?:/kubepods/.*pod[0-9a-fA-F-]+/|.*/docker[-/])([0-9a-fA-F]+)(?:\.scope)?$")
        .unwrap()
});

/// Extract the container id from cgroup file content.
///
/// Returns an empty string when no hierarchy names a container, or when two
/// hierarchies disagree (attribution is then considered unreliable).
pub fn container_id_from_data(data: &str) -> String {
    let mut container_id = String::new();
    for captures in CGROUP_RE.captures_iter(data) {
        let candidate = &captures[1];
        if container_id.is_empty() {
            container_id = candidate.to_string();
        } else if container_id != candidate {
            return String::new();
        }
    }
    container_id
}

/// Read and decode `/proc/<pid>/cgroup`. Unreadable files (the process died)
/// yield an empty id.
pub fn container_id_for_pid(proc_root: &Path, pid: i32) -> String {
    match std::fs::read_to_string(proc_root.join(pid.to_string()).join("cgroup")) {
        Ok(data) => container_id_from_data(&data),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_cgroup_v1() {
        let data = "\
12:devices:/docker/5b8f83412931055bcc5da35e41ada85fd70015673163d56911cac4fe6693273f
11:cpu,cpuacct:/docker/5b8f83412931055bcc5da35e41ada85fd70015673163d56911cac4fe6693273f
1:name=systemd:/docker/5b8f83412931055bcc5da35e41ada85fd70015673163d56911cac4fe6693273f
";
        assert_eq!(
            container_id_from_data(data),
            "5b8f83412931055bcc5da35e41ada85fd70015673163d56911cac4fe6693273f"
        );
    }

    #[test]
    fn systemd_scope_unit() {
        let data = "0::/system.slice/docker-abcdef0123456789abcdef0123456789abcdef0123456789abcdef01234567.scope\n";
        assert_eq!(
            container_id_from_data(data),
            "abcdef0123456789abcdef0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn host_process_has_no_container() {
        let data = "12:devices:/\n11:cpu,cpuacct:/user.slice\n";
        assert_eq!(container_id_from_data(data), "");
    }

    #[test]
    fn conflicting_hierarchies_abort_detection() {
        let data = "\
12:devices:/docker/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
11:cpu,cpuacct:/docker/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb
";
        assert_eq!(container_id_from_data(data), "");
    }
}
