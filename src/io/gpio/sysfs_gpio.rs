use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use sysfs_gpio::{Direction, Error, Pin, PinPoller};

use crate::io::gpio::{Edge, EdgeMode, GPIOBackend, GPIOError, GPIOMode, Pull, SYSFS_GPIO_ROOT};

/// Legacy backend driving the per-pin `export`/`direction`/`value`/`edge`
/// pseudo-files. Pins are given chip-relative and offset by the chip's base.
pub struct SysFsGPIO {
    chip: String,
    base: Option<u64>,
    initialised: AtomicBool,
    resolved_base: Mutex<u64>,
    gpios: Mutex<HashMap<u32, Arc<SysFsLine>>>,
}

struct SysFsLine {
    pin: Pin,
    mode: GPIOMode,
    poller: Mutex<Option<PinPoller>>,
}

impl SysFsGPIO {
    pub fn new(chip: &str, base: Option<u32>) -> SysFsGPIO {
        SysFsGPIO {
            chip: chip.to_owned(),
            base: base.map(u64::from),
            initialised: AtomicBool::new(false),
            resolved_base: Mutex::new(0),
            gpios: Mutex::new(HashMap::new()),
        }
    }

    fn gpios(&self) -> MutexGuard<'_, HashMap<u32, Arc<SysFsLine>>> {
        self.gpios.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn line(&self, pin: u32) -> Result<Arc<SysFsLine>, GPIOError> {
        self.gpios().get(&pin).cloned().ok_or(GPIOError::NotFound { pin })
    }

    fn global_number(&self, pin: u32) -> u64 {
        *self.resolved_base.lock().unwrap_or_else(PoisonError::into_inner) + u64::from(pin)
    }

    fn unexport(line: &SysFsLine) {
        if let Err(err) = line.pin.unexport() {
            warn!("Failed to unexport gpio{}: {}", line.pin.get_pin_num(), err);
        }
    }
}

impl GPIOBackend for SysFsGPIO {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn init(&self) -> Result<(), GPIOError> {
        if self.is_initialised() {
            return Ok(());
        }
        let root = Path::new(SYSFS_GPIO_ROOT);
        if !root.join("export").exists() {
            return Err(GPIOError::Unsupported(format!("{}/export is missing", SYSFS_GPIO_ROOT)));
        }
        let base = match self.base {
            Some(base) => base,
            None => read_chip_base(root, &self.chip)?,
        };
        debug!("sysfs: {} has base {}", self.chip, base);
        *self.resolved_base.lock().unwrap_or_else(PoisonError::into_inner) = base;
        self.initialised.store(true, Ordering::Release);
        Ok(())
    }

    fn shutdown(&self) {
        for (_, line) in self.gpios().drain() {
            Self::unexport(&line);
        }
        self.initialised.store(false, Ordering::Release);
    }

    fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::Acquire)
    }

    fn configure(&self, pin_id: u32, mode: GPIOMode, pull: Pull) -> Result<(), GPIOError> {
        if !self.is_initialised() {
            return Err(GPIOError::NotInitialized);
        }
        if pull != Pull::Disabled {
            warn!("Pin {}: {:?} bias is not settable through sysfs", pin_id, pull);
        }
        if let Some(previous) = self.gpios().remove(&pin_id) {
            Self::unexport(&previous);
        }

        debug!("Setting up pin {}", pin_id);
        let pin = Pin::new(self.global_number(pin_id));
        pin.export().map_err(map_sysfs_err)?;
        let direction = match mode {
            GPIOMode::Input => Direction::In,
            GPIOMode::Output { initial: true } => Direction::High,
            GPIOMode::Output { initial: false } => Direction::Low,
        };
        pin.set_direction(direction).map_err(map_sysfs_err)?;
        self.gpios().insert(
            pin_id,
            Arc::new(SysFsLine {
                pin,
                mode,
                poller: Mutex::new(None),
            }),
        );
        Ok(())
    }

    fn release(&self, pin: u32) -> Result<(), GPIOError> {
        let line = self.gpios().remove(&pin).ok_or(GPIOError::NotFound { pin })?;
        Self::unexport(&line);
        Ok(())
    }

    fn read(&self, pin: u32) -> Result<bool, GPIOError> {
        let line = self.line(pin)?;
        match line.pin.get_value().map_err(map_sysfs_err)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(GPIOError::other(format!("gpio{} reported value {}", pin, other))),
        }
    }

    fn write(&self, pin: u32, value: bool) -> Result<(), GPIOError> {
        let line = self.line(pin)?;
        if !line.mode.is_output() {
            return Err(GPIOError::PinInIncorrectMode { pin, required: "an output" });
        }
        line.pin.set_value(u8::from(value)).map_err(map_sysfs_err)
    }

    fn set_edge(&self, pin: u32, edge: EdgeMode) -> Result<(), GPIOError> {
        let line = self.line(pin)?;
        if line.mode.is_output() {
            return Err(GPIOError::PinInIncorrectMode { pin, required: "an input" });
        }
        let sysfs_edge = match edge {
            EdgeMode::None => sysfs_gpio::Edge::NoInterrupt,
            EdgeMode::Rising => sysfs_gpio::Edge::RisingEdge,
            EdgeMode::Falling => sysfs_gpio::Edge::FallingEdge,
            EdgeMode::Both => sysfs_gpio::Edge::BothEdges,
        };
        line.pin.set_edge(sysfs_edge).map_err(map_sysfs_err)?;
        let poller = match edge {
            EdgeMode::None => None,
            _ => Some(line.pin.get_poller().map_err(map_sysfs_err)?),
        };
        *line.poller.lock().unwrap_or_else(PoisonError::into_inner) = poller;
        Ok(())
    }

    fn wait_edge(&self, pin: u32, timeout: Duration) -> Result<Edge, GPIOError> {
        let line = self.line(pin)?;
        let mut poller = line.poller.lock().unwrap_or_else(PoisonError::into_inner);
        let poller = poller
            .as_mut()
            .ok_or_else(|| GPIOError::InvalidParam(format!("edge detection is not armed on pin {}", pin)))?;
        let millis = timeout.as_millis().min(isize::MAX as u128) as isize;
        match poller.poll(millis).map_err(map_sysfs_err)? {
            Some(0) => Ok(Edge::Falling),
            Some(_) => Ok(Edge::Rising),
            None => Err(GPIOError::Timeout),
        }
    }
}

fn read_chip_base(root: &Path, chip: &str) -> Result<u64, GPIOError> {
    let base_file = root.join(chip).join("base");
    if !base_file.exists() {
        debug!("{} not present, assuming base 0", base_file.display());
        return Ok(0);
    }
    let raw = fs::read_to_string(&base_file)?;
    raw.trim()
        .parse()
        .map_err(|err| GPIOError::other(format!("invalid base in {}: {}", base_file.display(), err)))
}

fn map_sysfs_err(err: sysfs_gpio::Error) -> GPIOError {
    match err {
        Error::Io(err) => GPIOError::Io(err),
        Error::Unexpected(s) => GPIOError::other(s),
        Error::InvalidPath(s) => GPIOError::InvalidParam(s),
        Error::Unsupported(s) => GPIOError::Unsupported(s),
    }
}
