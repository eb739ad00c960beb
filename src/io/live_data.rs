use std::fmt::{self, Display};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::output::driver::OutputDriver;
use crate::output::OutputStatus;

/// One line of the console's output table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputSnapshot {
    pub id: i64,
    pub name: String,
    pub state: String,
    pub pwm_duty: f32,
    pub on_time_ms: u64,
    pub cycle_count: u32,
    pub lockout: bool,
    pub lockout_reason: Option<String>,
}

impl OutputSnapshot {
    pub fn new(id: i64, name: &str, status: &OutputStatus) -> Self {
        Self {
            id,
            name: name.to_owned(),
            state: status.state.to_string(),
            pwm_duty: status.pwm_duty,
            on_time_ms: status.total_on_time_ms,
            cycle_count: status.cycle_count,
            lockout: status.lockout,
            lockout_reason: status.lockout_reason.map(|reason| reason.to_string()),
        }
    }

    pub fn of(driver: &OutputDriver) -> Self {
        Self::new(driver.id(), driver.name(), &driver.status())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub outputs: Vec<OutputSnapshot>,
}

impl StatusReport {
    pub fn collect<'a>(timestamp: DateTime<Utc>, drivers: impl IntoIterator<Item = &'a OutputDriver>) -> Self {
        Self {
            timestamp,
            outputs: drivers.into_iter().map(OutputSnapshot::of).collect(),
        }
    }

    /// Write via a temporary file so readers never see a partial snapshot.
    pub fn write_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| format!("Failed to create {}: {}", parent.display(), err))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|err| format!("Failed to serialize status: {}", err))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|err| format!("Failed to write {}: {}", tmp.display(), err))?;
        fs::rename(&tmp, path).map_err(|err| format!("Failed to replace {}: {}", path.display(), err))
    }

    pub fn read_from(path: &Path) -> Result<Self, String> {
        let json = fs::read_to_string(path).map_err(|err| format!("Failed to read {}: {}", path.display(), err))?;
        serde_json::from_str(&json).map_err(|err| format!("Failed to parse {}: {}", path.display(), err))
    }
}

pub struct CheckAgeResult {
    max_age_seconds: i64,
    actual_age_seconds: i64,
    age_type: AgeType,
}

impl CheckAgeResult {
    pub fn age_type(&self) -> &AgeType {
        &self.age_type
    }
}

impl Display for CheckAgeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: {}s old, (max {}s)",
            self.age_type, self.actual_age_seconds, self.max_age_seconds
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AgeType {
    Good,
    GettingOld,
    TooOld,
}

pub fn check_age(timestamp: DateTime<Utc>, max_age: i64) -> CheckAgeResult {
    check_age_at(timestamp, max_age, Utc::now())
}

pub fn check_age_at(timestamp: DateTime<Utc>, max_age: i64, now: DateTime<Utc>) -> CheckAgeResult {
    let age_seconds = now.signed_duration_since(timestamp).num_seconds();

    let age_type = if age_seconds > max_age {
        AgeType::TooOld
    } else if age_seconds > warn_age(max_age) {
        AgeType::GettingOld
    } else {
        AgeType::Good
    };

    CheckAgeResult {
        max_age_seconds: max_age,
        actual_age_seconds: age_seconds,
        age_type,
    }
}

// Warn at 3/4 of error age.
fn warn_age(error_age: i64) -> i64 {
    (error_age / 4) * 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{LockoutReason, OutputState};
    use chrono::{Duration, TimeZone};

    #[test]
    fn ages() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let age = |secs| check_age_at(now - Duration::seconds(secs), 60, now);
        assert_eq!(age(10).age_type(), &AgeType::Good);
        assert_eq!(age(45).age_type(), &AgeType::Good);
        assert_eq!(age(46).age_type(), &AgeType::GettingOld);
        assert_eq!(age(61).age_type(), &AgeType::TooOld);
        assert_eq!(age(61).to_string(), "TooOld: 61s old, (max 60s)");
    }

    #[test]
    fn snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live").join("outputs.json");
        let status = OutputStatus {
            state: OutputState::Off,
            total_on_time_ms: 4000,
            cycle_count: 2,
            lockout: true,
            lockout_reason: Some(LockoutReason::EmergencyStop),
            ..OutputStatus::default()
        };
        let report = StatusReport {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            outputs: vec![OutputSnapshot::new(1, "Inlet valve", &status)],
        };
        report.write_to(&path).unwrap();

        let read = StatusReport::read_from(&path).unwrap();
        assert_eq!(read, report);
        assert_eq!(read.outputs[0].state, "OFF");
        assert_eq!(read.outputs[0].lockout_reason.as_deref(), Some("Emergency stop"));
        assert!(!path.with_extension("json.tmp").exists());
    }
}
