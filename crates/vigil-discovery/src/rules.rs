//! Recognition rules mapping process command lines to known services.

use std::path::Path;
use vigil_facts::SocketKind;

/// Linux dynamic port range: listeners there are almost always outgoing
/// sockets misread as services, so they are dropped unless a rule claims
/// the port explicitly.
pub const EPHEMERAL_PORT_START: u16 = 32768;

pub struct ServiceRule {
    pub name: &'static str,
    pub binaries: &'static [&'static str],
    /// Port assumed when no listening socket is observed; 0 = none.
    pub default_port: u16,
    pub default_network: SocketKind,
}

const RULES: &[ServiceRule] = &[
    ServiceRule {
        name: "memcached",
        binaries: &["memcached"],
        default_port: 11211,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "redis",
        binaries: &["redis-server"],
        default_port: 6379,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "nginx",
        binaries: &["nginx"],
        default_port: 80,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "apache",
        binaries: &["apache2", "httpd"],
        default_port: 80,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "haproxy",
        binaries: &["haproxy"],
        default_port: 0,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "rabbitmq",
        binaries: &["rabbitmq-server", "beam.smp", "beam"],
        default_port: 5672,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "mysql",
        binaries: &["mysqld", "mariadbd"],
        default_port: 3306,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "postgresql",
        binaries: &["postgres", "postmaster"],
        default_port: 5432,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "mongodb",
        binaries: &["mongod"],
        default_port: 27017,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "elasticsearch",
        binaries: &["elasticsearch"],
        default_port: 9200,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "zookeeper",
        binaries: &["zookeeper"],
        default_port: 2181,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "influxdb",
        binaries: &["influxd"],
        default_port: 8086,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "ntp",
        binaries: &["ntpd", "chronyd"],
        default_port: 123,
        default_network: SocketKind::Udp,
    },
    ServiceRule {
        name: "dovecot",
        binaries: &["dovecot"],
        default_port: 143,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "exim",
        binaries: &["exim4", "exim"],
        default_port: 25,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "postfix",
        binaries: &["master"],
        default_port: 25,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "openldap",
        binaries: &["slapd"],
        default_port: 389,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "ssh",
        binaries: &["sshd"],
        default_port: 22,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "varnish",
        binaries: &["varnishd"],
        default_port: 6082,
        default_network: SocketKind::Tcp,
    },
    ServiceRule {
        name: "squid",
        binaries: &["squid", "squid3"],
        default_port: 3128,
        default_network: SocketKind::Tcp,
    },
];

const INTERPRETERS: &[&str] = &[
    "python", "python2", "python3", "java", "node", "ruby", "perl", "php", "sh", "bash",
];

/// Binary name of a command-line token: basename, stripped of the `:`
/// suffix processes like `nginx: master process` leave on argv[0].
fn binary_name(token: &str) -> String {
    let first = token.split_whitespace().next().unwrap_or(token);
    let base = Path::new(first)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| first.to_string());
    base.trim_end_matches(':').to_string()
}

fn rule_for_binary(name: &str) -> Option<&'static ServiceRule> {
    RULES.iter().find(|rule| rule.binaries.contains(&name))
}

/// Map a command line to the service it implements, if recognized.
///
/// Interpreter processes (`python foo.py`, `java app.jar`) are resolved
/// through their first non-flag argument.
pub fn service_by_command(cmdline: &[String]) -> Option<&'static ServiceRule> {
    let first = cmdline.first()?;
    let name = binary_name(first);
    if let Some(rule) = rule_for_binary(&name) {
        return Some(rule);
    }
    if INTERPRETERS.contains(&name.as_str()) {
        let argument = cmdline.iter().skip(1).find(|arg| !arg.starts_with('-'))?;
        return rule_for_binary(&binary_name(argument));
    }
    None
}

/// Whether a listening address survives the ephemeral-port filter.
pub fn keep_address(port: u16, network: SocketKind, rule: &ServiceRule) -> bool {
    if network == SocketKind::Unix {
        return true;
    }
    port < EPHEMERAL_PORT_START || (port == rule.default_port && network == rule.default_network)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn recognizes_memcached_command() {
        let rule = service_by_command(&cmd(&[
            "/usr/bin/memcached",
            "-m",
            "64",
            "-p",
            "11211",
            "-u",
            "memcache",
            "-l",
            "127.0.0.1",
        ]))
        .unwrap();
        assert_eq!(rule.name, "memcached");
        assert_eq!(rule.default_port, 11211);
    }

    #[test]
    fn recognizes_container_style_argv() {
        let rule = service_by_command(&cmd(&["redis-server *:6379"])).unwrap();
        assert_eq!(rule.name, "redis");
    }

    #[test]
    fn recognizes_retitled_processes() {
        let rule = service_by_command(&cmd(&["nginx: master process /usr/sbin/nginx"])).unwrap();
        assert_eq!(rule.name, "nginx");
    }

    #[test]
    fn resolves_interpreters_through_arguments() {
        let rule = service_by_command(&cmd(&["/usr/bin/python3", "-u", "/opt/zookeeper"]));
        assert_eq!(rule.unwrap().name, "zookeeper");
        assert!(service_by_command(&cmd(&["python3", "-m", "-x"])).is_none());
    }

    #[test]
    fn unknown_commands_yield_none() {
        assert!(service_by_command(&cmd(&["/usr/bin/vim", "main.rs"])).is_none());
        assert!(service_by_command(&[]).is_none());
    }

    #[test]
    fn ephemeral_ports_are_dropped_unless_claimed() {
        let haproxy = service_by_command(&cmd(&["haproxy"])).unwrap();
        assert!(keep_address(80, SocketKind::Tcp, haproxy));
        assert!(!keep_address(42514, SocketKind::Udp, haproxy));

        let memcached = service_by_command(&cmd(&["memcached"])).unwrap();
        assert!(keep_address(11211, SocketKind::Tcp, memcached));
        assert!(keep_address(0, SocketKind::Unix, memcached));
    }
}
