//! Agent configuration: a TOML file overridden by `VIGIL_*` environment
//! variables.
//!
//! A variable overrides the config key whose dotted path, uppercased with
//! dots replaced by underscores, matches its name: `remote.api_base` is
//! overridden by `VIGIL_REMOTE_API_BASE`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "VIGIL_";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub logging: LoggingSection,
    pub web: WebSection,
    pub metric: MetricSection,
    pub thresholds: HashMap<String, ThresholdSection>,
    pub remote: RemoteSection,
    pub container: ContainerSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub state_file: PathBuf,
    pub netstat_file: PathBuf,
}

impl Default for AgentSection {
    fn default() -> Self {
        AgentSection {
            state_file: PathBuf::from("/var/lib/vigil/state.json"),
            netstat_file: PathBuf::from("/var/lib/vigil/netstat.out"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub listen_address: String,
    pub listen_port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        WebSection {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 8015,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricSection {
    /// Collection interval of the metric registry, in seconds.
    pub resolution: u64,
    pub softstatus_period_default: u64,
    pub softstatus_period: HashMap<String, u64>,
}

impl Default for MetricSection {
    fn default() -> Self {
        MetricSection {
            resolution: 10,
            softstatus_period_default: 300,
            softstatus_period: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ThresholdSection {
    pub low_critical: Option<f64>,
    pub low_warning: Option<f64>,
    pub high_warning: Option<f64>,
    pub high_critical: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub enabled: bool,
    pub api_base: String,
    pub account_id: String,
    pub registration_key: String,
    pub initial_agent_name: String,
    pub credential_domain: String,
}

impl Default for RemoteSection {
    fn default() -> Self {
        RemoteSection {
            enabled: true,
            api_base: "https://api.vigil.example/".to_string(),
            account_id: String::new(),
            registration_key: String::new(),
            initial_agent_name: String::new(),
            credential_domain: "agent.vigil.example".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerSection {
    pub enabled: bool,
    pub socket: PathBuf,
}

impl Default for ContainerSection {
    fn default() -> Self {
        ContainerSection {
            enabled: true,
            socket: PathBuf::from("/var/run/docker.sock"),
        }
    }
}

impl AgentConfig {
    /// Load the configuration file (a missing file means defaults) and
    /// apply environment overrides.
    pub fn load(path: &Path) -> Result<AgentConfig> {
        let mut value = match std::fs::read_to_string(path) {
            Ok(content) => content
                .parse::<toml::Value>()
                .with_context(|| format!("invalid configuration file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                toml::Value::Table(toml::map::Map::new())
            }
            Err(err) => {
                return Err(err).with_context(|| format!("unable to read {}", path.display()))
            }
        };
        apply_env_overrides(&mut value, std::env::vars());
        value
            .try_into()
            .with_context(|| format!("invalid configuration in {}", path.display()))
    }
}

/// Apply `VIGIL_*` variables onto a TOML document.
///
/// Paths are matched against the flattened default document, so an
/// override can also introduce a key the file omitted.
pub fn apply_env_overrides(value: &mut toml::Value, vars: impl Iterator<Item = (String, String)>) {
    for (name, raw) in vars {
        let Some(suffix) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let key = suffix.to_lowercase();
        let Some(path) = match_known_path(&key) else {
            tracing::debug!(variable = %name, "ignoring unknown configuration override");
            continue;
        };
        set_path(value, &path, &raw);
    }
}

/// Known dotted config paths, used to resolve the underscore form of an
/// environment variable back to its path.
fn known_paths() -> &'static [&'static str] {
    &[
        "agent.state_file",
        "agent.netstat_file",
        "logging.level",
        "web.listen_address",
        "web.listen_port",
        "metric.resolution",
        "metric.softstatus_period_default",
        "remote.enabled",
        "remote.api_base",
        "remote.account_id",
        "remote.registration_key",
        "remote.initial_agent_name",
        "remote.credential_domain",
        "container.enabled",
        "container.socket",
    ]
}

fn match_known_path(flat_key: &str) -> Option<Vec<String>> {
    known_paths()
        .iter()
        .find(|path| path.replace('.', "_") == flat_key)
        .map(|path| path.split('.').map(str::to_string).collect())
}

fn set_path(value: &mut toml::Value, path: &[String], raw: &str) {
    let mut current = value;
    for segment in &path[..path.len() - 1] {
        if !current.is_table() {
            return;
        }
        let table = current.as_table_mut().unwrap();
        current = table
            .entry(segment.clone())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
    let Some(table) = current.as_table_mut() else {
        return;
    };
    let leaf = path.last().unwrap().clone();
    let parsed = match table.get(&leaf) {
        // A typed leaf only accepts a value of its own type; an
        // unparseable override is dropped instead of breaking the config.
        Some(toml::Value::Boolean(_)) => match raw.parse::<bool>() {
            Ok(parsed) => toml::Value::Boolean(parsed),
            Err(_) => {
                tracing::warn!(key = %leaf, value = raw, "ignoring non-boolean override");
                return;
            }
        },
        Some(toml::Value::Integer(_)) => match raw.parse::<i64>() {
            Ok(parsed) => toml::Value::Integer(parsed),
            Err(_) => {
                tracing::warn!(key = %leaf, value = raw, "ignoring non-integer override");
                return;
            }
        },
        Some(toml::Value::Float(_)) => match raw.parse::<f64>() {
            Ok(parsed) => toml::Value::Float(parsed),
            Err(_) => {
                tracing::warn!(key = %leaf, value = raw, "ignoring non-float override");
                return;
            }
        },
        Some(toml::Value::String(_)) => toml::Value::String(raw.to_string()),
        // Leaves absent from the file: guess bools and integers, keep
        // strings as-is.
        _ => {
            if let Ok(parsed) = raw.parse::<bool>() {
                toml::Value::Boolean(parsed)
            } else if let Ok(parsed) = raw.parse::<i64>() {
                toml::Value::Integer(parsed)
            } else {
                toml::Value::String(raw.to_string())
            }
        }
    };
    table.insert(leaf, parsed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config: AgentConfig = toml::Value::Table(toml::map::Map::new())
            .try_into()
            .unwrap();
        assert_eq!(config.web.listen_port, 8015);
        assert_eq!(config.metric.resolution, 10);
        assert!(config.remote.enabled);
    }

    #[test]
    fn file_values_are_used() {
        let raw = r#"
[agent]
state_file = "/tmp/state.json"

[web]
listen_port = 9000

[thresholds.cpu_used]
high_warning = 80.0
high_critical = 90.0

[metric.softstatus_period]
disk_used_perc = 600
"#;
        let config: AgentConfig = raw.parse::<toml::Value>().unwrap().try_into().unwrap();
        assert_eq!(config.agent.state_file, PathBuf::from("/tmp/state.json"));
        assert_eq!(config.web.listen_port, 9000);
        assert_eq!(
            config.thresholds.get("cpu_used").unwrap().high_warning,
            Some(80.0)
        );
        assert_eq!(
            config.metric.softstatus_period.get("disk_used_perc"),
            Some(&600)
        );
    }

    #[test]
    fn env_overrides_follow_dotted_paths() {
        let mut value = "[remote]\napi_base = \"https://file.example/\""
            .parse::<toml::Value>()
            .unwrap();
        let vars = vec![
            (
                "VIGIL_REMOTE_API_BASE".to_string(),
                "https://env.example/".to_string(),
            ),
            ("VIGIL_WEB_LISTEN_PORT".to_string(), "9100".to_string()),
            ("VIGIL_REMOTE_ENABLED".to_string(), "false".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
            ("VIGIL_NO_SUCH_KEY".to_string(), "x".to_string()),
        ];
        apply_env_overrides(&mut value, vars.into_iter());

        let config: AgentConfig = value.try_into().unwrap();
        assert_eq!(config.remote.api_base, "https://env.example/");
        assert_eq!(config.web.listen_port, 9100);
        assert!(!config.remote.enabled);
    }

    #[test]
    fn env_override_respects_existing_types() {
        let mut value = "[web]\nlisten_port = 8015".parse::<toml::Value>().unwrap();
        apply_env_overrides(
            &mut value,
            vec![("VIGIL_WEB_LISTEN_PORT".to_string(), "not-a-port".to_string())].into_iter(),
        );
        // Unparseable override keeps the original value rather than
        // producing a type error at deserialization.
        let config: AgentConfig = value.try_into().unwrap();
        assert_eq!(config.web.listen_port, 8015);
    }
}
