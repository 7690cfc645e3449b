use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label holding the metric name inside a label set.
pub const LABEL_NAME: &str = "__name__";

/// Labels starting with this prefix are internal and never exposed.
pub const RESERVED_LABEL_PREFIX: &str = "__";

/// Status of a metric or check, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Unset,
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl Status {
    pub fn is_set(self) -> bool {
        self != Status::Unset
    }

    /// Numeric code as used by Nagios-compatible consumers.
    pub fn nagios_code(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Warning => 1,
            Status::Critical => 2,
            Status::Unknown | Status::Unset => 3,
        }
    }

    pub fn from_nagios_code(code: u8) -> Status {
        match code {
            0 => Status::Ok,
            1 => Status::Warning,
            2 => Status::Critical,
            _ => Status::Unknown,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Unset => write!(f, "unset"),
            Status::Ok => write!(f, "ok"),
            Status::Warning => write!(f, "warning"),
            Status::Critical => write!(f, "critical"),
            Status::Unknown => write!(f, "unknown"),
        }
    }
}

/// A status with its human-readable explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatusDescription {
    pub current_status: Status,
    pub description: String,
}

impl StatusDescription {
    pub fn new(status: Status, description: impl Into<String>) -> Self {
        Self {
            current_status: status,
            description: description.into(),
        }
    }
}

/// Out-of-band information attached to a point.
///
/// `item` distinguishes multiple instances of the same metric name (e.g. the
/// mountpoint of a disk metric). `status_of` is set on `*_status` companion
/// metrics and names the metric they describe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricAnnotations {
    pub status: Option<StatusDescription>,
    pub item: String,
    pub status_of: String,
}

/// One metric sample with its identifying label set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub labels: BTreeMap<String, String>,
    pub time: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub annotations: MetricAnnotations,
}

impl MetricPoint {
    pub fn new(name: impl Into<String>, time: DateTime<Utc>, value: f64) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_NAME.to_string(), name.into());
        Self {
            labels,
            time,
            value,
            annotations: MetricAnnotations::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.labels.get(LABEL_NAME).map(String::as_str).unwrap_or("")
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }
}

/// Canonical text form of a label set, used as map fingerprint.
///
/// Renders `name{key="value",...}` with keys in sorted order (BTreeMap
/// iteration order), the metric name outside the braces.
pub fn labels_to_text(labels: &BTreeMap<String, String>) -> String {
    let name = labels.get(LABEL_NAME).map(String::as_str).unwrap_or("");
    let mut out = String::with_capacity(name.len() + 16);
    out.push_str(name);
    let mut first = true;
    for (k, v) in labels {
        if k == LABEL_NAME {
            continue;
        }
        out.push(if first { '{' } else { ',' });
        first = false;
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(v);
        out.push('"');
    }
    if !first {
        out.push('}');
    }
    out
}

/// Something that accepts metric points. Implementations must not block on
/// the caller beyond their own short critical section.
pub trait PointPusher: Send + Sync {
    fn push_points(&self, points: Vec<MetricPoint>);
}

/// Kind of a gathered metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
    Untyped,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
            MetricKind::Untyped => "untyped",
        }
    }
}

/// A single label pair inside a sample. Lists of labels are kept sorted by
/// name so merging stays a linear walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One sample of a gathered family. The timestamp is captured at sample
/// creation; a missing timestamp means "now" at conversion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub labels: Vec<Label>,
    pub value: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A named group of samples sharing help text and kind, as returned by
/// gatherers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    /// Convert the family's samples to points, stamping `default_time` on
    /// samples without their own timestamp.
    pub fn to_points(&self, default_time: DateTime<Utc>) -> Vec<MetricPoint> {
        self.samples
            .iter()
            .map(|s| {
                let mut labels = BTreeMap::new();
                labels.insert(LABEL_NAME.to_string(), self.name.clone());
                for l in &s.labels {
                    labels.insert(l.name.clone(), l.value.clone());
                }
                MetricPoint {
                    labels,
                    time: s.timestamp.unwrap_or(default_time),
                    value: s.value,
                    annotations: MetricAnnotations::default(),
                }
            })
            .collect()
    }
}

/// Build a family from a list of points, dropping reserved labels.
pub fn points_to_family(name: &str, points: &[&MetricPoint]) -> MetricFamily {
    let samples = points
        .iter()
        .map(|p| {
            let labels = p
                .labels
                .iter()
                .filter(|(k, _)| !k.starts_with(RESERVED_LABEL_PREFIX))
                .map(|(k, v)| Label::new(k.clone(), v.clone()))
                .collect();
            Sample {
                labels,
                value: p.value,
                timestamp: Some(p.time),
            }
        })
        .collect();
    MetricFamily {
        name: name.to_string(),
        help: String::new(),
        kind: MetricKind::Untyped,
        samples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_nagios_roundtrip() {
        assert_eq!(Status::Ok.nagios_code(), 0);
        assert_eq!(Status::Warning.nagios_code(), 1);
        assert_eq!(Status::Critical.nagios_code(), 2);
        assert_eq!(Status::Unknown.nagios_code(), 3);
        assert_eq!(Status::from_nagios_code(2), Status::Critical);
        assert_eq!(Status::from_nagios_code(42), Status::Unknown);
    }

    #[test]
    fn labels_text_is_sorted_and_name_first() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_NAME.to_string(), "cpu_used".to_string());
        labels.insert("item".to_string(), "cpu0".to_string());
        labels.insert("core".to_string(), "1".to_string());
        assert_eq!(
            labels_to_text(&labels),
            "cpu_used{core=\"1\",item=\"cpu0\"}"
        );
    }

    #[test]
    fn labels_text_without_extra_labels() {
        let labels = MetricPoint::new("mem_used", Utc::now(), 1.0).labels;
        assert_eq!(labels_to_text(&labels), "mem_used");
    }

    #[test]
    fn family_to_points_keeps_sample_timestamps() {
        let t0 = Utc::now();
        let t1 = t0 - chrono::Duration::seconds(10);
        let family = MetricFamily {
            name: "io_reads".to_string(),
            help: String::new(),
            kind: MetricKind::Counter,
            samples: vec![
                Sample {
                    labels: vec![Label::new("item", "sda")],
                    value: 5.0,
                    timestamp: Some(t1),
                },
                Sample {
                    labels: vec![Label::new("item", "sdb")],
                    value: 7.0,
                    timestamp: None,
                },
            ],
        };
        let points = family.to_points(t0);
        assert_eq!(points[0].time, t1);
        assert_eq!(points[1].time, t0);
        assert_eq!(points[0].name(), "io_reads");
        assert_eq!(points[0].labels.get("item").unwrap(), "sda");
    }
}
