use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use vigil_common::Status;

/// Soft-status state for one `(metric, item)`.
///
/// Invariants: when `current_status` is ok both `*_since` fields are unset;
/// when warning, `critical_since` is unset; when critical,
/// `warning_since <= critical_since`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusState {
    pub current_status: Status,
    pub critical_since: Option<DateTime<Utc>>,
    pub warning_since: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

impl Default for StatusState {
    fn default() -> Self {
        StatusState {
            // A metric never seen before is treated as ok: a breach must
            // hold for the soft period before it is reported.
            current_status: Status::Ok,
            critical_since: None,
            warning_since: None,
            last_update: Utc::now(),
        }
    }
}

impl StatusState {
    /// Feed one raw status into the state machine.
    pub fn update(mut self, new_status: Status, period: Duration, now: DateTime<Utc>) -> StatusState {
        if !self.current_status.is_set() {
            self.current_status = Status::Ok;
        }

        // Wall clock went backward: restart the measurement.
        if self.critical_since.is_some_and(|t| t > now) {
            self.critical_since = None;
        }
        if self.warning_since.is_some_and(|t| t > now) {
            self.warning_since = None;
        }

        let mut critical_duration = Duration::ZERO;
        let mut warning_duration = Duration::ZERO;

        match new_status {
            Status::Critical => {
                let critical_since = *self.critical_since.get_or_insert(now);
                let warning_since = *self.warning_since.get_or_insert(now);
                critical_duration = (now - critical_since).to_std().unwrap_or_default();
                warning_duration = (now - warning_since).to_std().unwrap_or_default();
            }
            Status::Warning => {
                self.critical_since = None;
                let warning_since = *self.warning_since.get_or_insert(now);
                warning_duration = (now - warning_since).to_std().unwrap_or_default();
            }
            _ => {
                self.critical_since = None;
                self.warning_since = None;
            }
        }

        self.current_status = if period.is_zero() {
            new_status
        } else if critical_duration >= period {
            Status::Critical
        } else if warning_duration >= period {
            Status::Warning
        } else if self.current_status == Status::Critical && new_status == Status::Warning {
            // Downgrade immediately.
            Status::Warning
        } else if new_status == Status::Ok {
            Status::Ok
        } else {
            self.current_status
        };

        self.last_update = Utc::now();
        self
    }
}
