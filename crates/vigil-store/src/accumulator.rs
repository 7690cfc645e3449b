//! Field-oriented entry point over a [`PointPusher`].
//!
//! Inputs and checks think in `(measurement, fields, tags)`; this converts
//! each field to a [`MetricPoint`], attaching per-field statuses and
//! optionally emitting `<name>_status` companions.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use vigil_common::{MetricPoint, PointPusher, StatusDescription, LABEL_NAME};

#[derive(Clone)]
pub struct FieldsAccumulator {
    pusher: Arc<dyn PointPusher>,
}

impl FieldsAccumulator {
    pub fn new(pusher: Arc<dyn PointPusher>) -> FieldsAccumulator {
        FieldsAccumulator { pusher }
    }

    pub fn add_fields(
        &self,
        measurement: &str,
        fields: &HashMap<String, f64>,
        tags: &HashMap<String, String>,
        time: Option<DateTime<Utc>>,
    ) {
        self.add_fields_with_status(measurement, fields, tags, &HashMap::new(), false, time);
    }

    /// Push one point per field. Fields present in `statuses` carry the
    /// given status annotation; with `create_status_of` a companion
    /// `<name>_status` point (value = Nagios code) is pushed as well.
    pub fn add_fields_with_status(
        &self,
        measurement: &str,
        fields: &HashMap<String, f64>,
        tags: &HashMap<String, String>,
        statuses: &HashMap<String, StatusDescription>,
        create_status_of: bool,
        time: Option<DateTime<Utc>>,
    ) {
        let time = time.unwrap_or_else(Utc::now);
        let item = tags.get("item").cloned().unwrap_or_default();
        let mut points = Vec::with_capacity(fields.len());

        for (field, value) in fields {
            let name = if measurement.is_empty() {
                field.clone()
            } else {
                format!("{measurement}_{field}")
            };
            let mut point = MetricPoint::new(name.clone(), time, *value);
            for (k, v) in tags {
                point = point.with_label(k.clone(), v.clone());
            }
            point.annotations.item = item.clone();

            if let Some(status) = statuses.get(field) {
                point.annotations.status = Some(status.clone());
                if create_status_of {
                    let mut status_point = point.clone();
                    status_point
                        .labels
                        .insert(LABEL_NAME.to_string(), format!("{name}_status"));
                    status_point.value = f64::from(status.current_status.nagios_code());
                    status_point.annotations.status_of = name.clone();
                    points.push(point);
                    points.push(status_point);
                    continue;
                }
            }
            points.push(point);
        }

        self.pusher.push_points(points);
    }
}

/// Helper for check runners: a single status-valued metric.
pub fn push_check_result(
    accumulator: &FieldsAccumulator,
    metric_name: &str,
    item: &str,
    status: StatusDescription,
) {
    let mut fields = HashMap::new();
    fields.insert(
        metric_name.to_string(),
        f64::from(status.current_status.nagios_code()),
    );
    let mut tags = HashMap::new();
    if !item.is_empty() {
        tags.insert("item".to_string(), item.to_string());
    }
    let mut statuses = HashMap::new();
    statuses.insert(metric_name.to_string(), status);
    accumulator.add_fields_with_status("", &fields, &tags, &statuses, false, None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vigil_common::Status;

    #[derive(Default)]
    struct Sink {
        points: Mutex<Vec<MetricPoint>>,
    }

    impl PointPusher for Sink {
        fn push_points(&self, points: Vec<MetricPoint>) {
            self.points.lock().unwrap().extend(points);
        }
    }

    #[test]
    fn fields_become_prefixed_points() {
        let sink = Arc::new(Sink::default());
        let acc = FieldsAccumulator::new(sink.clone());

        let mut fields = HashMap::new();
        fields.insert("used".to_string(), 80.0);
        fields.insert("free".to_string(), 20.0);
        let mut tags = HashMap::new();
        tags.insert("item".to_string(), "/home".to_string());

        acc.add_fields("disk", &fields, &tags, None);

        let points = sink.points.lock().unwrap();
        assert_eq!(points.len(), 2);
        let names: Vec<&str> = points.iter().map(|p| p.name()).collect();
        assert!(names.contains(&"disk_used"));
        assert!(names.contains(&"disk_free"));
        assert!(points.iter().all(|p| p.annotations.item == "/home"));
        assert!(points.iter().all(|p| p.labels.get("item").unwrap() == "/home"));
    }

    #[test]
    fn status_companion_created_on_request() {
        let sink = Arc::new(Sink::default());
        let acc = FieldsAccumulator::new(sink.clone());

        let mut fields = HashMap::new();
        fields.insert("used_perc".to_string(), 97.0);
        let mut statuses = HashMap::new();
        statuses.insert(
            "used_perc".to_string(),
            StatusDescription::new(Status::Critical, "Disk nearly full"),
        );

        acc.add_fields_with_status("disk", &fields, &HashMap::new(), &statuses, true, None);

        let points = sink.points.lock().unwrap();
        assert_eq!(points.len(), 2);
        let status_point = points
            .iter()
            .find(|p| p.name() == "disk_used_perc_status")
            .unwrap();
        assert_eq!(status_point.value, 2.0);
        assert_eq!(status_point.annotations.status_of, "disk_used_perc");
    }

    #[test]
    fn check_result_uses_bare_field_name() {
        let sink = Arc::new(Sink::default());
        let acc = FieldsAccumulator::new(sink.clone());
        push_check_result(
            &acc,
            "memcached_status",
            "memcached",
            StatusDescription::new(Status::Ok, "TCP OK"),
        );

        let points = sink.points.lock().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].name(), "memcached_status");
        assert_eq!(points[0].value, 0.0);
        assert_eq!(
            points[0].annotations.status.as_ref().unwrap().current_status,
            Status::Ok
        );
    }
}
