use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::io::gpio::{ErrorKind, GPIOError};

pub mod driver;
pub mod interlock;
pub mod pulse;


pub const DEFAULT_CHIP: &str = "gpiochip0";
pub const DEFAULT_PULSE_MS: u32 = 100;
/// A PWM output counts as ON above this duty.
pub const PWM_ON_THRESHOLD: f32 = 0.01;
/// Non-PWM outputs driven through `set_pwm` switch ON above this duty.
pub const DIGITAL_ON_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum OutputType {
    Relay,
    Pwm,
    Latching,
    Momentary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum OutputState {
    Off,
    On,
    Error,
    Unknown,
}

/// Why an output refused (or was forced out of) a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum LockoutReason {
    #[strum(serialize = "Min off time")]
    MinOffTime,
    #[strum(serialize = "Min on time")]
    MinOnTime,
    #[strum(serialize = "Interlock active")]
    InterlockActive,
    #[strum(serialize = "Auto shutoff")]
    AutoShutoff,
    #[strum(serialize = "Emergency stop")]
    EmergencyStop,
}

impl LockoutReason {
    /// Latched lockouts block turning ON until `reset_lockout`.
    pub fn is_latched(&self) -> bool {
        matches!(self, LockoutReason::AutoShutoff | LockoutReason::EmergencyStop)
    }
}

/// Immutable description of one actuator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputConfig {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub output_type: OutputType,
    pub pin: u32,
    #[serde(default = "default_chip")]
    pub chip: String,
    #[serde(default)]
    pub active_low: bool,
    #[serde(default)]
    pub pwm_frequency_hz: u32,
    #[serde(default)]
    pub pwm_min_duty: f32,
    #[serde(default = "default_max_duty")]
    pub pwm_max_duty: f32,
    #[serde(default, rename = "min_on_ms")]
    pub min_on_time_ms: u32,
    #[serde(default, rename = "min_off_ms")]
    pub min_off_time_ms: u32,
    #[serde(default, rename = "max_on_secs")]
    pub max_on_time_sec: u32,
    /// Default pulse length; 0 falls back to [DEFAULT_PULSE_MS].
    #[serde(default)]
    pub pulse_ms: u32,
    #[serde(default)]
    pub interlock_group: Option<u32>,
}

fn default_chip() -> String {
    DEFAULT_CHIP.to_owned()
}

fn default_max_duty() -> f32 {
    1.0
}

impl OutputConfig {
    pub fn new(id: i64, name: &str, output_type: OutputType, pin: u32) -> Self {
        Self {
            id,
            name: name.to_owned(),
            output_type,
            pin,
            chip: default_chip(),
            active_low: false,
            pwm_frequency_hz: 0,
            pwm_min_duty: 0.0,
            pwm_max_duty: 1.0,
            min_on_time_ms: 0,
            min_off_time_ms: 0,
            max_on_time_sec: 0,
            pulse_ms: 0,
            interlock_group: None,
        }
    }

    pub fn validate(&self) -> Result<(), OutputError> {
        if self.name.trim().is_empty() {
            return Err(OutputError::InvalidParam(format!("output {} has no name", self.id)));
        }
        let in_range = |duty: f32| (0.0..=1.0).contains(&duty);
        if !in_range(self.pwm_min_duty) || !in_range(self.pwm_max_duty) || self.pwm_min_duty > self.pwm_max_duty {
            return Err(OutputError::InvalidParam(format!(
                "{}: PWM duty bounds [{}, {}] must satisfy 0 <= min <= max <= 1",
                self.name, self.pwm_min_duty, self.pwm_max_duty
            )));
        }
        Ok(())
    }

    /// Electrical level that represents `on` for this wiring.
    pub fn electrical_level(&self, on: bool) -> bool {
        on != self.active_low
    }
}

/// Mutable runtime state, owned by one [driver::OutputDriver].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputStatus {
    pub state: OutputState,
    pub pwm_duty: f32,
    pub last_change: Option<DateTime<Utc>>,
    pub last_on: Option<DateTime<Utc>>,
    pub last_off: Option<DateTime<Utc>>,
    pub total_on_time_ms: u64,
    pub cycle_count: u32,
    pub lockout: bool,
    pub lockout_reason: Option<LockoutReason>,
}

impl Default for OutputStatus {
    fn default() -> Self {
        Self {
            state: OutputState::Unknown,
            pwm_duty: 0.0,
            last_change: None,
            last_on: None,
            last_off: None,
            total_on_time_ms: 0,
            cycle_count: 0,
            lockout: false,
            lockout_reason: None,
        }
    }
}

impl OutputStatus {
    pub fn is_on(&self) -> bool {
        self.state == OutputState::On
    }

    pub fn latched_lockout(&self) -> Option<LockoutReason> {
        self.lockout_reason.filter(|reason| self.lockout && reason.is_latched())
    }

    fn set_lockout(&mut self, reason: LockoutReason) {
        self.lockout = true;
        self.lockout_reason = Some(reason);
    }

    /// Clears timing/interlock lockouts; latched ones stay until reset.
    fn clear_transient_lockout(&mut self) {
        if self.latched_lockout().is_none() {
            self.lockout = false;
            self.lockout_reason = None;
        }
    }
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error(transparent)]
    Gpio(#[from] GPIOError),
    #[error("refused: {0}")]
    Busy(LockoutReason),
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("not initialised: {0}")]
    NotInitialized(String),
}

impl OutputError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OutputError::Gpio(err) => err.kind(),
            OutputError::Busy(_) => ErrorKind::Busy,
            OutputError::InvalidParam(_) => ErrorKind::InvalidParam,
            OutputError::NotInitialized(_) => ErrorKind::NotInitialized,
        }
    }
}
