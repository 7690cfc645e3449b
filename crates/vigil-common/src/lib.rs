//! Shared data model for the vigil agent.
//!
//! Every subsystem exchanges [`types::MetricPoint`]s and statuses defined
//! here; durable agent state goes through [`state::State`].

pub mod delay;
pub mod state;
pub mod types;

pub use types::{
    labels_to_text, points_to_family, Label, MetricAnnotations, MetricFamily, MetricKind,
    MetricPoint, PointPusher, Sample, Status, StatusDescription, LABEL_NAME,
    RESERVED_LABEL_PREFIX,
};
