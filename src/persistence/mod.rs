use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::output::{OutputConfig, OutputStatus, OutputType};

pub mod database;

/// What an actuator should do when the field bus goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum SafeState {
    #[default]
    Off,
    On,
    Hold,
}

/// Durable twin of an [OutputConfig].
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorRecord {
    /// Assigned by the database; ignored on insert.
    pub id: i64,
    pub slot: u16,
    pub subslot: u16,
    pub name: String,
    pub output_type: OutputType,
    pub gpio_pin: u32,
    pub gpio_chip: String,
    pub active_low: bool,
    pub safe_state: SafeState,
    pub min_on_time_ms: u32,
    pub max_on_time_ms: u32,
    pub pwm_frequency_hz: u32,
    pub enabled: bool,
}

impl ActuatorRecord {
    pub fn new(name: &str, output_type: OutputType, gpio_pin: u32, gpio_chip: &str) -> Self {
        Self {
            id: 0,
            slot: 0,
            subslot: 0,
            name: name.to_owned(),
            output_type,
            gpio_pin,
            gpio_chip: gpio_chip.to_owned(),
            active_low: false,
            safe_state: SafeState::Off,
            min_on_time_ms: 0,
            max_on_time_ms: 0,
            pwm_frequency_hz: 0,
            enabled: true,
        }
    }
}

/// Mutable half of a persisted actuator.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorStateRow {
    pub actuator_id: i64,
    pub is_on: bool,
    /// 0-255
    pub pwm_duty: u8,
    pub total_on_time_ms: u64,
    pub cycle_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl ActuatorStateRow {
    pub fn from_status(actuator_id: i64, status: &OutputStatus, updated_at: DateTime<Utc>) -> Self {
        Self {
            actuator_id,
            is_on: status.is_on(),
            pwm_duty: duty_to_byte(status.pwm_duty),
            total_on_time_ms: status.total_on_time_ms,
            cycle_count: status.cycle_count,
            updated_at,
        }
    }
}

pub fn duty_to_byte(duty: f32) -> u8 {
    (duty.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub fn byte_to_duty(duty: u8) -> f32 {
    f32::from(duty) / 255.0
}

impl OutputConfig {
    /// Driver configuration for a stored actuator. Fields the record does not
    /// carry keep their defaults.
    pub fn from_record(record: &ActuatorRecord) -> Self {
        let mut config = OutputConfig::new(record.id, &record.name, record.output_type, record.gpio_pin);
        config.chip = record.gpio_chip.clone();
        config.active_low = record.active_low;
        config.min_on_time_ms = record.min_on_time_ms;
        config.max_on_time_sec = record.max_on_time_ms.div_ceil(1000);
        config.pwm_frequency_hz = record.pwm_frequency_hz;
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConflictKind {
    Actuator,
    Sensor,
}

/// Existing claim on a (pin, chip) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinConflict {
    pub kind: ConflictKind,
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("actuator {0} not found")]
    NotFound(i64),
    #[error("bad stored value in {column}: {value}")]
    BadValue { column: &'static str, value: String },
    #[error("pin {pin} on {chip} already used by {} {} ('{}')", .conflict.kind, .conflict.id, .conflict.name)]
    PinInUse {
        pin: u32,
        chip: String,
        conflict: PinConflict,
    },
}

/// Must be consulted before a new or edited actuator is accepted.
#[async_trait]
pub trait ConflictChecker: Send + Sync {
    /// Any actuator other than `excluding_id`, or any GPIO sensor, already on `(pin, chip)`.
    async fn check_pin_conflict(
        &self,
        pin: u32,
        chip: &str,
        excluding_id: Option<i64>,
    ) -> Result<Option<PinConflict>, PersistenceError>;

    /// Convenience wrapper turning a conflict into an error.
    async fn ensure_pin_free(&self, pin: u32, chip: &str, excluding_id: Option<i64>) -> Result<(), PersistenceError> {
        match self.check_pin_conflict(pin, chip, excluding_id).await? {
            None => Ok(()),
            Some(conflict) => Err(PersistenceError::PinInUse {
                pin,
                chip: chip.to_owned(),
                conflict,
            }),
        }
    }
}

/// Conflict checking over a fixed list of configured outputs, for running
/// without a database.
pub struct ConfiguredOutputs {
    outputs: Vec<OutputConfig>,
}

impl ConfiguredOutputs {
    pub fn new(outputs: Vec<OutputConfig>) -> Self {
        Self { outputs }
    }
}

#[async_trait]
impl ConflictChecker for ConfiguredOutputs {
    async fn check_pin_conflict(
        &self,
        pin: u32,
        chip: &str,
        excluding_id: Option<i64>,
    ) -> Result<Option<PinConflict>, PersistenceError> {
        Ok(self
            .outputs
            .iter()
            .filter(|output| Some(output.id) != excluding_id)
            .find(|output| output.pin == pin && output.chip == chip)
            .map(|output| PinConflict {
                kind: ConflictKind::Actuator,
                id: output.id,
                name: output.name.clone(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputState;

    #[test]
    fn duty_byte_conversion() {
        assert_eq!(duty_to_byte(0.0), 0);
        assert_eq!(duty_to_byte(1.0), 255);
        assert_eq!(duty_to_byte(0.5), 128);
        assert_eq!(duty_to_byte(3.0), 255);
        assert!((byte_to_duty(255) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn config_from_record() {
        let mut record = ActuatorRecord::new("Dosing pump", OutputType::Pwm, 12, "gpiochip1");
        record.id = 4;
        record.active_low = true;
        record.min_on_time_ms = 250;
        record.max_on_time_ms = 1500;
        record.pwm_frequency_hz = 1000;

        let config = OutputConfig::from_record(&record);
        assert_eq!(config.id, 4);
        assert_eq!(config.chip, "gpiochip1");
        assert!(config.active_low);
        assert_eq!(config.min_on_time_ms, 250);
        assert_eq!(config.max_on_time_sec, 2);
        assert_eq!(config.pwm_frequency_hz, 1000);
        assert_eq!(config.interlock_group, None);
    }

    #[test]
    fn state_row_from_status() {
        let status = OutputStatus {
            state: OutputState::On,
            pwm_duty: 1.0,
            total_on_time_ms: 9000,
            cycle_count: 7,
            ..OutputStatus::default()
        };
        let row = ActuatorStateRow::from_status(3, &status, Utc::now());
        assert!(row.is_on);
        assert_eq!(row.pwm_duty, 255);
        assert_eq!(row.total_on_time_ms, 9000);
        assert_eq!(row.cycle_count, 7);
    }

    #[tokio::test]
    async fn configured_outputs_conflicts() {
        let checker = ConfiguredOutputs::new(vec![
            OutputConfig::new(1, "Inlet valve", OutputType::Relay, 17),
            OutputConfig::new(2, "Drain valve", OutputType::Relay, 18),
        ]);
        let conflict = checker.check_pin_conflict(17, "gpiochip0", Some(2)).await.unwrap().unwrap();
        assert_eq!(conflict.kind, ConflictKind::Actuator);
        assert_eq!(conflict.id, 1);
        assert_eq!(conflict.name, "Inlet valve");

        assert!(checker.check_pin_conflict(17, "gpiochip0", Some(1)).await.unwrap().is_none());
        assert!(checker.check_pin_conflict(17, "gpiochip1", None).await.unwrap().is_none());
        assert!(checker.ensure_pin_free(18, "gpiochip0", None).await.is_err());
    }
}
