//! Threshold evaluation with soft-status hysteresis.
//!
//! The registry wraps a point sink: each inbound point without a status is
//! matched against its threshold, run through the soft-period state
//! machine, and re-emitted enriched together with a `<name>_status`
//! companion metric.

mod state_machine;

pub use state_machine::StatusState;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vigil_common::state::State;
use vigil_common::{MetricPoint, PointPusher, Status, StatusDescription, LABEL_NAME};
use vigil_task::{Runner, Shutdown};

const STATUS_STATE_KEY: &str = "threshold_status_state";
const STATE_SAVE_INTERVAL: Duration = Duration::from_secs(60);
const STATE_EVICTION_MINUTES: i64 = 60;
const DEFAULT_SOFT_PERIOD: Duration = Duration::from_secs(300);

/// `(metric name, item)` key of a threshold or threshold state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricNameItem {
    pub name: String,
    pub item: String,
}

impl MetricNameItem {
    pub fn new(name: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            item: item.into(),
        }
    }
}

/// Min/max limits; NaN marks a limit as unset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Threshold {
    pub low_critical: f64,
    pub low_warning: f64,
    pub high_warning: f64,
    pub high_critical: f64,
}

impl Default for Threshold {
    fn default() -> Self {
        Threshold {
            low_critical: f64::NAN,
            low_warning: f64::NAN,
            high_warning: f64::NAN,
            high_critical: f64::NAN,
        }
    }
}

fn limits_equal(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

impl Threshold {
    pub fn from_limits(
        low_critical: Option<f64>,
        low_warning: Option<f64>,
        high_warning: Option<f64>,
        high_critical: Option<f64>,
    ) -> Threshold {
        Threshold {
            low_critical: low_critical.unwrap_or(f64::NAN),
            low_warning: low_warning.unwrap_or(f64::NAN),
            high_warning: high_warning.unwrap_or(f64::NAN),
            high_critical: high_critical.unwrap_or(f64::NAN),
        }
    }

    /// All limits unset (or the all-zero value, which is not a valid
    /// configuration and comes from zero-initialized structures).
    pub fn is_zero(&self) -> bool {
        if self.low_critical.is_nan()
            && self.low_warning.is_nan()
            && self.high_warning.is_nan()
            && self.high_critical.is_nan()
        {
            return true;
        }
        self.low_critical == 0.0
            && self.low_warning == 0.0
            && self.high_warning == 0.0
            && self.high_critical == 0.0
    }

    pub fn equal(&self, other: &Threshold) -> bool {
        limits_equal(self.low_critical, other.low_critical)
            && limits_equal(self.low_warning, other.low_warning)
            && limits_equal(self.high_warning, other.high_warning)
            && limits_equal(self.high_critical, other.high_critical)
    }

    /// Raw status of a value, with the exceeded limit when not ok.
    pub fn current_status(&self, value: f64) -> (Status, f64) {
        if !self.low_critical.is_nan() && value < self.low_critical {
            return (Status::Critical, self.low_critical);
        }
        if !self.low_warning.is_nan() && value < self.low_warning {
            return (Status::Warning, self.low_warning);
        }
        if !self.high_critical.is_nan() && value > self.high_critical {
            return (Status::Critical, self.high_critical);
        }
        if !self.high_warning.is_nan() && value > self.high_warning {
            return (Status::Warning, self.high_warning);
        }
        (Status::Ok, f64::NAN)
    }
}

/// Display unit of a metric.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Unit {
    #[serde(default, rename = "unit")]
    pub unit_type: i32,
    #[serde(default)]
    pub unit_text: String,
}

pub const UNIT_TYPE_UNIT: i32 = 0;
pub const UNIT_TYPE_BYTE: i32 = 2;
pub const UNIT_TYPE_BIT: i32 = 3;

fn format_value(value: f64, unit: &Unit) -> String {
    match unit.unit_type {
        UNIT_TYPE_UNIT => format!("{value:.2}"),
        UNIT_TYPE_BYTE | UNIT_TYPE_BIT => {
            let scales = ["", "K", "M", "G", "T", "P", "E"];
            let mut value = value;
            let mut index = 0;
            while index < scales.len() - 1 && value.abs() >= 1024.0 {
                index += 1;
                value /= 1024.0;
            }
            format!("{value:.2} {}{}s", scales[index], unit.unit_text)
        }
        _ => format!("{value:.2} {}", unit.unit_text),
    }
}

fn format_duration(period: Duration) -> String {
    if period.is_zero() {
        return String::new();
    }
    let units: [(f64, &str); 4] = [
        (1.0, "second"),
        (60.0, "minute"),
        (60.0, "hour"),
        (24.0, "day"),
    ];
    let mut value = period.as_secs_f64();
    let mut current_unit = "";
    for (scale, name) in units {
        if (value / scale).round() >= 1.0 {
            value /= scale;
            current_unit = name;
        } else {
            break;
        }
    }
    let value = value.round();
    let plural = if value > 1.0 { "s" } else { "" };
    format!("{value:.0} {current_unit}{plural}")
}

#[derive(Serialize, Deserialize)]
struct SavedState {
    #[serde(flatten)]
    key: MetricNameItem,
    #[serde(flatten)]
    state: StatusState,
}

struct Inner {
    states: HashMap<MetricNameItem, StatusState>,
    thresholds: HashMap<MetricNameItem, Threshold>,
    thresholds_all_item: HashMap<String, Threshold>,
    units: HashMap<MetricNameItem, Unit>,
    default_soft_period: Duration,
    soft_periods: HashMap<String, Duration>,
}

/// Threshold registry: configuration tables plus per-metric soft state.
pub struct Registry {
    state: Arc<State>,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(state: Arc<State>) -> Registry {
        let mut states = HashMap::new();
        if let Some(saved) = state.get::<Vec<SavedState>>(STATUS_STATE_KEY) {
            for entry in saved {
                states.insert(entry.key, entry.state);
            }
        }
        Registry {
            state,
            inner: Mutex::new(Inner {
                states,
                thresholds: HashMap::new(),
                thresholds_all_item: HashMap::new(),
                units: HashMap::new(),
                default_soft_period: DEFAULT_SOFT_PERIOD,
                soft_periods: HashMap::new(),
            }),
        }
    }

    /// Configure thresholds. The per-item table is consulted first; the
    /// any-item table matches on metric name alone.
    pub fn set_thresholds(
        &self,
        with_item: HashMap<MetricNameItem, Threshold>,
        all_item: HashMap<String, Threshold>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        tracing::debug!(
            with_item = with_item.len(),
            all_item = all_item.len(),
            "thresholds configured"
        );
        inner.thresholds = with_item;
        inner.thresholds_all_item = all_item;
    }

    /// Configure the soft-status period: a status must hold for this long
    /// before being reported (per-metric overrides win).
    pub fn set_soft_period(&self, default_period: Duration, per_metric: HashMap<String, Duration>) {
        let mut inner = self.inner.lock().unwrap();
        inner.default_soft_period = default_period;
        inner.soft_periods = per_metric;
    }

    pub fn set_units(&self, units: HashMap<MetricNameItem, Unit>) {
        let mut inner = self.inner.lock().unwrap();
        inner.units = units;
    }

    pub fn get_threshold(&self, key: &MetricNameItem) -> Threshold {
        let inner = self.inner.lock().unwrap();
        lookup_threshold(&inner, key)
    }

    /// Wrap `downstream`: points flowing through the returned pusher get
    /// threshold evaluation applied.
    pub fn wrap_pusher(self: &Arc<Self>, downstream: Arc<dyn PointPusher>) -> Arc<dyn PointPusher> {
        Arc::new(ThresholdPusher {
            registry: Arc::clone(self),
            downstream,
        })
    }

    fn save_and_evict(&self, now: DateTime<Utc>) {
        let saved: Vec<SavedState> = {
            let mut inner = self.inner.lock().unwrap();
            inner.states.retain(|_, state| {
                now - state.last_update < ChronoDuration::minutes(STATE_EVICTION_MINUTES)
            });
            inner
                .states
                .iter()
                .map(|(key, state)| SavedState {
                    key: key.clone(),
                    state: state.clone(),
                })
                .collect()
        };
        if let Err(err) = self.state.set(STATUS_STATE_KEY, &saved) {
            tracing::warn!(error = %err, "unable to persist threshold states");
        }
    }
}

fn lookup_threshold(inner: &Inner, key: &MetricNameItem) -> Threshold {
    if let Some(threshold) = inner.thresholds.get(key) {
        return *threshold;
    }
    match inner.thresholds_all_item.get(&key.name) {
        Some(threshold) if !threshold.is_zero() => *threshold,
        _ => Threshold::default(),
    }
}

#[async_trait]
impl Runner for Registry {
    /// Periodically persist the state map, and once more on shutdown.
    async fn run(&self, shutdown: Shutdown) -> Result<()> {
        loop {
            let stopped = shutdown.sleep(STATE_SAVE_INTERVAL).await;
            self.save_and_evict(Utc::now());
            if stopped {
                return Ok(());
            }
        }
    }
}

struct ThresholdPusher {
    registry: Arc<Registry>,
    downstream: Arc<dyn PointPusher>,
}

impl PointPusher for ThresholdPusher {
    fn push_points(&self, points: Vec<MetricPoint>) {
        let result = {
            let mut inner = self.registry.inner.lock().unwrap();
            let mut result = Vec::with_capacity(points.len());
            for point in points {
                let already_has_status = point
                    .annotations
                    .status
                    .as_ref()
                    .is_some_and(|s| s.current_status.is_set());
                if already_has_status {
                    result.push(point);
                    continue;
                }
                let key = MetricNameItem {
                    name: point.name().to_string(),
                    item: point.annotations.item.clone(),
                };
                let threshold = lookup_threshold(&inner, &key);
                if threshold.is_zero() {
                    result.push(point);
                    continue;
                }
                evaluate_point(&mut inner, &mut result, point, &threshold, key);
            }
            result
        };
        // Delegate without holding the registry lock.
        self.downstream.push_points(result);
    }
}

fn evaluate_point(
    inner: &mut Inner,
    result: &mut Vec<MetricPoint>,
    point: MetricPoint,
    threshold: &Threshold,
    key: MetricNameItem,
) {
    let (soft_status, threshold_limit) = threshold.current_status(point.value);
    let period = inner
        .soft_periods
        .get(&key.name)
        .copied()
        .unwrap_or(inner.default_soft_period);

    let previous = inner.states.get(&key).cloned().unwrap_or_default();
    let new_state = previous.update(soft_status, period, Utc::now());
    inner.states.insert(key.clone(), new_state.clone());

    let unit = inner.units.get(&key).cloned().unwrap_or_default();
    // Consumers expect threshold descriptions to start with "Current value:".
    let mut description = format!("Current value: {}", format_value(point.value, &unit));
    if new_state.current_status != Status::Ok {
        if !period.is_zero() {
            description.push_str(&format!(
                " threshold ({}) exceeded over last {}",
                format_value(threshold_limit, &unit),
                format_duration(period),
            ));
        } else {
            description.push_str(&format!(
                " threshold ({}) exceeded",
                format_value(threshold_limit, &unit),
            ));
        }
    }

    let status = StatusDescription::new(new_state.current_status, description);

    let mut enriched = point.clone();
    enriched.annotations.status = Some(status.clone());
    result.push(enriched);

    let mut status_point = point;
    let name = key.name;
    status_point
        .labels
        .insert(LABEL_NAME.to_string(), format!("{name}_status"));
    status_point.value = f64::from(status.current_status.nagios_code());
    status_point.annotations.status = Some(status);
    status_point.annotations.status_of = name;
    result.push(status_point);
}
