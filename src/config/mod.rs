use serde::Deserialize;
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;
use std::path::PathBuf;
use std::time::Duration;

use crate::io::gpio::BackendKind;
use crate::output::interlock::OverflowPolicy;
use crate::output::{OutputConfig, DEFAULT_CHIP};

#[derive(Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    gpio: GPIOConfig,
    #[serde(default)]
    interlock: InterlockConfig,
    #[serde(default)]
    database: Option<DatabaseConfig>,
    #[serde(default)]
    control: ControlConfig,
    /// Used when no database is configured.
    #[serde(default)]
    outputs: Vec<OutputConfig>,
    /// Per-actuator settings the database does not carry.
    #[serde(default)]
    tuning: Vec<OutputTuning>,
}

impl Config {
    pub fn get_gpio(&self) -> &GPIOConfig {
        &self.gpio
    }

    pub fn get_interlock(&self) -> &InterlockConfig {
        &self.interlock
    }

    pub fn get_database(&self) -> Option<&DatabaseConfig> {
        self.database.as_ref()
    }

    pub fn get_control_config(&self) -> &ControlConfig {
        &self.control
    }

    pub fn get_outputs(&self) -> &[OutputConfig] {
        &self.outputs
    }

    pub fn get_tuning(&self, actuator_id: i64) -> Option<&OutputTuning> {
        self.tuning.iter().find(|tuning| tuning.id == actuator_id)
    }
}

#[derive(Deserialize, Clone)]
pub struct GPIOConfig {
    #[serde(default = "default_chip")]
    chip: String,
    #[serde(default)]
    backend: BackendKind,
    #[serde(default = "default_consumer")]
    consumer: String,
    /// 0 means unbounded.
    #[serde(default)]
    max_pins: usize,
    /// Overrides `/sys/class/gpio/<chip>/base` for the sysfs backend.
    #[serde(default)]
    sysfs_base: Option<u32>,
}

fn default_chip() -> String {
    DEFAULT_CHIP.to_owned()
}

fn default_consumer() -> String {
    "rtu-outputs".to_owned()
}

impl Default for GPIOConfig {
    fn default() -> Self {
        Self {
            chip: default_chip(),
            backend: BackendKind::Auto,
            consumer: default_consumer(),
            max_pins: 0,
            sysfs_base: None,
        }
    }
}

impl GPIOConfig {
    pub fn chip(&self) -> &str {
        &self.chip
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn max_pins(&self) -> Option<usize> {
        Some(self.max_pins).filter(|max| *max > 0)
    }

    pub fn sysfs_base(&self) -> Option<u32> {
        self.sysfs_base
    }
}

#[derive(Deserialize, Clone)]
pub struct InterlockConfig {
    #[serde(default = "default_max_groups")]
    max_groups: usize,
    #[serde(default)]
    overflow: OverflowPolicy,
}

fn default_max_groups() -> usize {
    16
}

impl Default for InterlockConfig {
    fn default() -> Self {
        Self {
            max_groups: default_max_groups(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl InterlockConfig {
    pub fn max_groups(&self) -> usize {
        self.max_groups
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }
}

#[derive(Deserialize, Clone)]
pub struct DatabaseConfig {
    path: String,
}

impl DatabaseConfig {
    pub fn get_path(&self) -> &str {
        &self.path
    }
}

#[serde_as]
#[derive(Deserialize, Clone)]
pub struct ControlConfig {
    /// How often every driver's `process()` runs.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(default = "default_process_interval")]
    process_interval_ms: Duration,
    /// Where the JSON status snapshot is written. None disables it.
    #[serde(default)]
    status_file: Option<PathBuf>,
}

fn default_process_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            process_interval_ms: default_process_interval(),
            status_file: None,
        }
    }
}

impl ControlConfig {
    pub fn get_process_interval(&self) -> &Duration {
        &self.process_interval_ms
    }

    pub fn get_status_file(&self) -> Option<&PathBuf> {
        self.status_file.as_ref()
    }
}

/// Driver settings layered over a stored actuator, matched by id.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct OutputTuning {
    pub id: i64,
    #[serde(default)]
    pub interlock_group: Option<u32>,
    #[serde(default, rename = "min_off_ms")]
    pub min_off_time_ms: Option<u32>,
    #[serde(default)]
    pub pwm_min_duty: Option<f32>,
    #[serde(default)]
    pub pwm_max_duty: Option<f32>,
    #[serde(default)]
    pub pulse_ms: Option<u32>,
}

impl OutputTuning {
    pub fn apply(&self, config: &mut OutputConfig) {
        if self.interlock_group.is_some() {
            config.interlock_group = self.interlock_group;
        }
        if let Some(min_off) = self.min_off_time_ms {
            config.min_off_time_ms = min_off;
        }
        if let Some(min) = self.pwm_min_duty {
            config.pwm_min_duty = min;
        }
        if let Some(max) = self.pwm_max_duty {
            config.pwm_max_duty = max;
        }
        if let Some(pulse) = self.pulse_ms {
            config.pulse_ms = pulse;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputType;
    use std::fs;

    #[test]
    fn test_serialize() {
        let config_str = fs::read_to_string("test/testconfig.toml")
            .expect("Unable to read test config file. Is it missing?");
        let config: Config = toml::from_str(&config_str).expect("Error reading test config file");

        assert_eq!(config.gpio.chip(), "gpiochip0");
        assert_eq!(config.gpio.backend(), BackendKind::Dummy);
        assert_eq!(config.gpio.consumer(), "rtu-test");
        assert_eq!(config.gpio.max_pins(), Some(64));
        assert_eq!(config.gpio.sysfs_base(), None);

        assert_eq!(config.interlock.max_groups(), 8);
        assert_eq!(config.interlock.overflow(), OverflowPolicy::FailClosed);

        assert_eq!(config.get_database().unwrap().get_path(), "rtu.db");
        assert_eq!(config.control.get_process_interval(), &Duration::from_millis(250));
        assert_eq!(
            config.control.get_status_file(),
            Some(&PathBuf::from("live").join("outputs.json"))
        );

        assert_eq!(config.outputs.len(), 2);
        let inlet = &config.outputs[0];
        assert_eq!(inlet.id, 1);
        assert_eq!(inlet.name, "Inlet valve");
        assert_eq!(inlet.output_type, OutputType::Relay);
        assert_eq!(inlet.pin, 17);
        assert_eq!(inlet.chip, "gpiochip0");
        assert_eq!(inlet.min_on_time_ms, 5000);
        assert_eq!(inlet.max_on_time_sec, 600);
        assert_eq!(inlet.interlock_group, Some(1));

        let pump = &config.outputs[1];
        assert_eq!(pump.output_type, OutputType::Pwm);
        assert!(pump.active_low);
        assert!((pump.pwm_min_duty - 0.1).abs() < f32::EPSILON);
        assert!((pump.pwm_max_duty - 0.9).abs() < f32::EPSILON);
        assert_eq!(pump.interlock_group, None);

        let tuning = config.get_tuning(3).unwrap();
        assert_eq!(tuning.interlock_group, Some(2));
        assert_eq!(tuning.min_off_time_ms, Some(2000));
        assert!(config.get_tuning(1).is_none());
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.gpio.chip(), DEFAULT_CHIP);
        assert_eq!(config.gpio.backend(), BackendKind::Auto);
        assert_eq!(config.gpio.max_pins(), None);
        assert_eq!(config.interlock.max_groups(), 16);
        assert_eq!(config.interlock.overflow(), OverflowPolicy::FailOpen);
        assert!(config.get_database().is_none());
        assert_eq!(config.control.get_process_interval(), &Duration::from_millis(100));
        assert!(config.outputs.is_empty());
    }

    #[test]
    fn tuning_overrides_record_defaults() {
        let mut config = OutputConfig::new(3, "Chlorine pump", OutputType::Pwm, 12);
        let tuning = OutputTuning {
            id: 3,
            interlock_group: Some(2),
            min_off_time_ms: Some(1500),
            pwm_min_duty: None,
            pwm_max_duty: Some(0.8),
            pulse_ms: None,
        };
        tuning.apply(&mut config);
        assert_eq!(config.interlock_group, Some(2));
        assert_eq!(config.min_off_time_ms, 1500);
        assert_eq!(config.pwm_min_duty, 0.0);
        assert!((config.pwm_max_duty - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.pulse_ms, 0);
    }
}
