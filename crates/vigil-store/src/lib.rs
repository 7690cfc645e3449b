//! In-memory time-series store.
//!
//! Points are kept per label-set fingerprint for about one hour; the store
//! feeds the local query API and the synchronizer's "metric exists" checks.

pub mod accumulator;

pub use accumulator::FieldsAccumulator;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vigil_common::{labels_to_text, MetricAnnotations, MetricPoint, PointPusher};
use vigil_task::{Runner, Shutdown};

const RETENTION_MINUTES: i64 = 60;
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Description of one stored series.
#[derive(Debug, Clone)]
pub struct Metric {
    pub labels: BTreeMap<String, String>,
    pub annotations: MetricAnnotations,
}

impl Metric {
    pub fn name(&self) -> &str {
        self.labels
            .get(vigil_common::LABEL_NAME)
            .map(String::as_str)
            .unwrap_or("")
    }
}

struct Series {
    metric: Metric,
    points: Vec<(DateTime<Utc>, f64)>,
}

/// The store itself. Cheap to clone; clones share the same series map.
#[derive(Clone)]
pub struct Store {
    series: Arc<Mutex<HashMap<String, Series>>>,
}

impl Store {
    pub fn new() -> Store {
        Store {
            series: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Series whose labels contain every `(key, value)` pair of `filter`.
    pub fn metrics(&self, filter: &BTreeMap<String, String>) -> Vec<Metric> {
        let series = self.series.lock().unwrap();
        series
            .values()
            .filter(|s| {
                filter
                    .iter()
                    .all(|(k, v)| s.metric.labels.get(k) == Some(v))
            })
            .map(|s| s.metric.clone())
            .collect()
    }

    pub fn metrics_count(&self) -> usize {
        self.series.lock().unwrap().len()
    }

    /// Points of the series identified by its canonical label text, newest
    /// last, restricted to `since`.
    pub fn points(&self, labels_text: &str, since: DateTime<Utc>) -> Vec<(DateTime<Utc>, f64)> {
        let series = self.series.lock().unwrap();
        let Some(s) = series.get(labels_text) else {
            return Vec::new();
        };
        s.points
            .iter()
            .filter(|(t, _)| *t >= since)
            .copied()
            .collect()
    }

    /// Latest point of every stored series.
    pub fn latest_points(&self) -> Vec<MetricPoint> {
        let series = self.series.lock().unwrap();
        series
            .values()
            .filter_map(|s| {
                s.points.last().map(|(time, value)| MetricPoint {
                    labels: s.metric.labels.clone(),
                    time: *time,
                    value: *value,
                    annotations: s.metric.annotations.clone(),
                })
            })
            .collect()
    }

    fn purge(&self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::minutes(RETENTION_MINUTES);
        let mut series = self.series.lock().unwrap();
        series.retain(|_, s| {
            s.points.retain(|(t, _)| *t >= cutoff);
            !s.points.is_empty()
        });
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl PointPusher for Store {
    fn push_points(&self, points: Vec<MetricPoint>) {
        let mut series = self.series.lock().unwrap();
        for point in points {
            let key = labels_to_text(&point.labels);
            let entry = series.entry(key).or_insert_with(|| Series {
                metric: Metric {
                    labels: point.labels.clone(),
                    annotations: point.annotations.clone(),
                },
                points: Vec::new(),
            });
            entry.metric.annotations = point.annotations;
            entry.points.push((point.time, point.value));
        }
    }
}

#[async_trait]
impl Runner for Store {
    async fn run(&self, shutdown: Shutdown) -> Result<()> {
        loop {
            if shutdown.sleep(PURGE_INTERVAL).await {
                return Ok(());
            }
            self.purge(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_one(store: &Store, name: &str, item: &str, time: DateTime<Utc>, value: f64) {
        let mut point = MetricPoint::new(name, time, value);
        if !item.is_empty() {
            point = point.with_label("item", item);
        }
        store.push_points(vec![point]);
    }

    #[test]
    fn push_and_filter() {
        let store = Store::new();
        let now = Utc::now();
        push_one(&store, "cpu_used", "", now, 42.0);
        push_one(&store, "disk_used", "/", now, 80.0);
        push_one(&store, "disk_used", "/home", now, 50.0);

        assert_eq!(store.metrics_count(), 3);

        let mut filter = BTreeMap::new();
        filter.insert(vigil_common::LABEL_NAME.to_string(), "disk_used".to_string());
        assert_eq!(store.metrics(&filter).len(), 2);

        filter.insert("item".to_string(), "/".to_string());
        let matched = store.metrics(&filter);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].labels.get("item").unwrap(), "/");
    }

    #[test]
    fn points_since_and_same_series_accumulate() {
        let store = Store::new();
        let now = Utc::now();
        push_one(&store, "cpu_used", "", now - ChronoDuration::seconds(20), 1.0);
        push_one(&store, "cpu_used", "", now, 2.0);

        assert_eq!(store.metrics_count(), 1);
        let points = store.points("cpu_used", now - ChronoDuration::seconds(30));
        assert_eq!(points.len(), 2);
        let recent = store.points("cpu_used", now - ChronoDuration::seconds(5));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].1, 2.0);
    }

    #[test]
    fn purge_drops_old_points_and_empty_series() {
        let store = Store::new();
        let now = Utc::now();
        push_one(&store, "old_metric", "", now - ChronoDuration::minutes(90), 1.0);
        push_one(&store, "live_metric", "", now, 2.0);

        store.purge(now);
        assert_eq!(store.metrics_count(), 1);
        assert!(store.points("old_metric", now - ChronoDuration::hours(2)).is_empty());
    }

    #[test]
    fn latest_points_returns_newest() {
        let store = Store::new();
        let now = Utc::now();
        push_one(&store, "cpu_used", "", now - ChronoDuration::seconds(10), 1.0);
        push_one(&store, "cpu_used", "", now, 7.0);

        let latest = store.latest_points();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].value, 7.0);
    }
}
