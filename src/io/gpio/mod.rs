use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::Deserialize;
use thiserror::Error;

use crate::config::GPIOConfig;

pub mod dummy;
pub mod registry;
pub mod subscription;

#[cfg(target_family = "unix")]
pub mod cdev;

#[cfg(target_family = "unix")]
pub mod sysfs_gpio;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GPIOMode {
    Input,
    /// Output, driven to the given electrical level as part of the request.
    Output { initial: bool },
}

impl GPIOMode {
    pub fn is_output(&self) -> bool {
        matches!(self, GPIOMode::Output { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Pull {
    #[default]
    Disabled,
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EdgeMode {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeMode {
    pub fn accepts(&self, edge: Edge) -> bool {
        match self {
            EdgeMode::None => false,
            EdgeMode::Rising => edge == Edge::Rising,
            EdgeMode::Falling => edge == Edge::Falling,
            EdgeMode::Both => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    /// The level the line settled at after this edge.
    pub fn level(&self) -> bool {
        matches!(self, Edge::Rising)
    }

    pub fn between(from: bool, to: bool) -> Option<Edge> {
        match (from, to) {
            (false, true) => Some(Edge::Rising),
            (true, false) => Some(Edge::Falling),
            _ => None,
        }
    }
}

/// Coarse classification shared by GPIO and output errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotInitialized,
    NotFound,
    IoError,
    Busy,
    Timeout,
    NoMemory,
    InvalidParam,
}

#[derive(Debug, Error)]
pub enum GPIOError {
    #[error("GPIO backend has not been initialised")]
    NotInitialized,
    #[error("pin {pin} has not been configured")]
    NotFound { pin: u32 },
    #[error("pin {pin} is not configured as {required}")]
    PinInIncorrectMode { pin: u32, required: &'static str },
    #[error("GPIO I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for an edge")]
    Timeout,
    #[error("pin table is full ({capacity} pins)")]
    NoMemory { capacity: usize },
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl GPIOError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GPIOError::NotInitialized => ErrorKind::NotInitialized,
            GPIOError::NotFound { .. } => ErrorKind::NotFound,
            GPIOError::Io(_) => ErrorKind::IoError,
            GPIOError::Timeout => ErrorKind::Timeout,
            GPIOError::NoMemory { .. } => ErrorKind::NoMemory,
            GPIOError::PinInIncorrectMode { .. }
            | GPIOError::InvalidParam(_)
            | GPIOError::Unsupported(_) => ErrorKind::InvalidParam,
        }
    }

    pub(crate) fn other(msg: impl Display) -> Self {
        GPIOError::Io(std::io::Error::other(msg.to_string()))
    }
}

/// Raw pin access for one chip.
///
/// Implementations synchronise internally so that a blocked `wait_edge` on one
/// pin never stalls reads or writes on another.
pub trait GPIOBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Acquire the chip. Calling this more than once is a no-op.
    fn init(&self) -> Result<(), GPIOError>;

    /// Release every pin and the chip handle.
    fn shutdown(&self);

    fn is_initialised(&self) -> bool;

    /// Bind `pin`, dropping any previous binding for it first.
    fn configure(&self, pin: u32, mode: GPIOMode, pull: Pull) -> Result<(), GPIOError>;

    fn release(&self, pin: u32) -> Result<(), GPIOError>;

    fn read(&self, pin: u32) -> Result<bool, GPIOError>;

    fn write(&self, pin: u32, value: bool) -> Result<(), GPIOError>;

    fn set_edge(&self, pin: u32, edge: EdgeMode) -> Result<(), GPIOError>;

    /// Block until an armed edge fires on `pin` or `timeout` elapses.
    fn wait_edge(&self, pin: u32, timeout: Duration) -> Result<Edge, GPIOError>;
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Auto,
    Cdev,
    Sysfs,
    Dummy,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::Auto => "auto",
            BackendKind::Cdev => "cdev",
            BackendKind::Sysfs => "sysfs",
            BackendKind::Dummy => "dummy",
        };
        write!(f, "{}", s)
    }
}

pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// Work out which kernel interface is available for `chip`.
pub fn probe(chip: &str) -> Option<BackendKind> {
    probe_in(Path::new("/dev"), Path::new(SYSFS_GPIO_ROOT), chip)
}

fn probe_in(dev_root: &Path, sysfs_root: &Path, chip: &str) -> Option<BackendKind> {
    if dev_root.join(chip).exists() {
        Some(BackendKind::Cdev)
    } else if sysfs_root.join("export").exists() {
        Some(BackendKind::Sysfs)
    } else {
        None
    }
}

/// Pick the backend once at startup.
pub fn select_backend(config: &GPIOConfig) -> Result<Box<dyn GPIOBackend>, GPIOError> {
    let kind = match config.backend() {
        BackendKind::Auto => probe(config.chip()).ok_or_else(|| {
            GPIOError::Unsupported(format!(
                "neither /dev/{} nor {}/export exist",
                config.chip(),
                SYSFS_GPIO_ROOT
            ))
        })?,
        kind => kind,
    };
    info!("Using {} GPIO backend for {}", kind, config.chip());
    make_backend(kind, config)
}

#[cfg(target_family = "unix")]
fn make_backend(kind: BackendKind, config: &GPIOConfig) -> Result<Box<dyn GPIOBackend>, GPIOError> {
    match kind {
        BackendKind::Cdev => Ok(Box::new(cdev::CDevGPIO::new(
            Path::new("/dev").join(config.chip()),
            config.consumer(),
        ))),
        BackendKind::Sysfs => Ok(Box::new(sysfs_gpio::SysFsGPIO::new(
            config.chip(),
            config.sysfs_base(),
        ))),
        BackendKind::Dummy => Ok(Box::new(dummy::Dummy::new())),
        BackendKind::Auto => Err(GPIOError::InvalidParam("backend must be resolved before construction".into())),
    }
}

#[cfg(not(target_family = "unix"))]
fn make_backend(kind: BackendKind, _config: &GPIOConfig) -> Result<Box<dyn GPIOBackend>, GPIOError> {
    match kind {
        BackendKind::Dummy => Ok(Box::new(dummy::Dummy::new())),
        kind => Err(GPIOError::Unsupported(format!("{} backend needs a unix target", kind))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_prefers_character_device() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("dev");
        let sysfs = dir.path().join("gpio");
        std::fs::create_dir_all(&dev).unwrap();
        std::fs::create_dir_all(&sysfs).unwrap();

        assert_eq!(probe_in(&dev, &sysfs, "gpiochip0"), None);

        std::fs::write(sysfs.join("export"), "").unwrap();
        assert_eq!(probe_in(&dev, &sysfs, "gpiochip0"), Some(BackendKind::Sysfs));

        std::fs::write(dev.join("gpiochip0"), "").unwrap();
        assert_eq!(probe_in(&dev, &sysfs, "gpiochip0"), Some(BackendKind::Cdev));
    }

    #[test]
    fn edge_mode_filters() {
        assert!(EdgeMode::Both.accepts(Edge::Falling));
        assert!(EdgeMode::Rising.accepts(Edge::Rising));
        assert!(!EdgeMode::Rising.accepts(Edge::Falling));
        assert!(!EdgeMode::None.accepts(Edge::Rising));
        assert_eq!(Edge::between(false, true), Some(Edge::Rising));
        assert_eq!(Edge::between(true, true), None);
    }

    #[test]
    fn error_kinds() {
        assert_eq!(GPIOError::NotFound { pin: 3 }.kind(), ErrorKind::NotFound);
        assert_eq!(GPIOError::other("boom").kind(), ErrorKind::IoError);
        assert_eq!(GPIOError::NoMemory { capacity: 1 }.kind(), ErrorKind::NoMemory);
    }
}
