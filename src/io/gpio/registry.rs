use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info};

use crate::io::gpio::subscription::EdgeSubscription;
use crate::io::gpio::{Edge, EdgeMode, GPIOBackend, GPIOError, GPIOMode, Pull};

/// Edge notification target: `(pin, level)`. Any context the listener needs is
/// captured by the closure.
pub type EdgeCallback = Arc<dyn Fn(u32, bool) + Send + Sync>;

#[derive(Clone)]
pub struct PinState {
    mode: GPIOMode,
    pull: Pull,
    edge: EdgeMode,
    callback: Option<EdgeCallback>,
}

impl PinState {
    pub fn mode(&self) -> GPIOMode {
        self.mode
    }

    pub fn pull(&self) -> Pull {
        self.pull
    }

    pub fn edge(&self) -> EdgeMode {
        self.edge
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }
}

impl Debug for PinState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinState")
            .field("mode", &self.mode)
            .field("pull", &self.pull)
            .field("edge", &self.edge)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Bookkeeping for the configured pins of one chip.
///
/// `configure`, `release` and the callback operations hold the table lock for
/// their duration. Reads, writes, edge arming and edge waits only check the
/// table and then call the backend unlocked, so a backend blocked on one line
/// never stalls the others.
pub struct GPIORegistry {
    backend: Box<dyn GPIOBackend>,
    chip: String,
    /// `None` = grows on demand.
    capacity: Option<usize>,
    pins: Mutex<HashMap<u32, PinState>>,
}

impl GPIORegistry {
    pub fn new(backend: Box<dyn GPIOBackend>, chip: &str, capacity: Option<usize>) -> Self {
        Self {
            backend,
            chip: chip.to_owned(),
            capacity,
            pins: Mutex::new(HashMap::new()),
        }
    }

    fn pins(&self) -> MutexGuard<'_, HashMap<u32, PinState>> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn chip(&self) -> &str {
        &self.chip
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn init(&self) -> Result<(), GPIOError> {
        self.backend.init()
    }

    /// Release every configured pin, then the chip.
    pub fn shutdown(&self) {
        let mut pins = self.pins();
        for pin in pins.keys() {
            if let Err(err) = self.backend.release(*pin) {
                debug!("Releasing pin {} during shutdown: {}", pin, err);
            }
        }
        pins.clear();
        self.backend.shutdown();
        info!("GPIO {} shut down", self.chip);
    }

    pub fn configure(&self, pin: u32, mode: GPIOMode, pull: Pull) -> Result<(), GPIOError> {
        if !self.backend.is_initialised() {
            return Err(GPIOError::NotInitialized);
        }
        let mut pins = self.pins();
        if let Some(capacity) = self.capacity {
            if !pins.contains_key(&pin) && pins.len() >= capacity {
                return Err(GPIOError::NoMemory { capacity });
            }
        }
        // A failed request leaves the pin unconfigured rather than half-bound.
        pins.remove(&pin);
        self.backend.configure(pin, mode, pull)?;
        debug!("Configured {} pin {} as {:?}", self.chip, pin, mode);
        pins.insert(
            pin,
            PinState {
                mode,
                pull,
                edge: EdgeMode::None,
                callback: None,
            },
        );
        Ok(())
    }

    pub fn release(&self, pin: u32) -> Result<(), GPIOError> {
        let mut pins = self.pins();
        pins.remove(&pin).ok_or(GPIOError::NotFound { pin })?;
        self.backend.release(pin)?;
        debug!("Released {} pin {}", self.chip, pin);
        Ok(())
    }

    pub fn read(&self, pin: u32) -> Result<bool, GPIOError> {
        if !self.pins().contains_key(&pin) {
            return Err(GPIOError::NotFound { pin });
        }
        self.backend.read(pin)
    }

    pub fn write(&self, pin: u32, value: bool) -> Result<(), GPIOError> {
        {
            let pins = self.pins();
            let state = pins.get(&pin).ok_or(GPIOError::NotFound { pin })?;
            if !state.mode.is_output() {
                return Err(GPIOError::PinInIncorrectMode { pin, required: "an output" });
            }
        }
        self.backend.write(pin, value)
    }

    pub fn set_edge(&self, pin: u32, edge: EdgeMode) -> Result<(), GPIOError> {
        let mode = {
            let pins = self.pins();
            let state = pins.get(&pin).ok_or(GPIOError::NotFound { pin })?;
            if state.mode.is_output() {
                return Err(GPIOError::PinInIncorrectMode { pin, required: "an input" });
            }
            state.mode
        };
        let result = self.backend.set_edge(pin, edge);
        // A concurrent reconfigure wins; its binding has no edge armed.
        if let Some(state) = self.pins().get_mut(&pin).filter(|state| state.mode == mode) {
            state.edge = if result.is_ok() { edge } else { EdgeMode::None };
        }
        result
    }

    pub fn wait_edge(&self, pin: u32, timeout: Duration) -> Result<Edge, GPIOError> {
        {
            let pins = self.pins();
            let state = pins.get(&pin).ok_or(GPIOError::NotFound { pin })?;
            if state.edge == EdgeMode::None {
                return Err(GPIOError::InvalidParam(format!("edge detection is not armed on pin {}", pin)));
            }
        }
        self.backend.wait_edge(pin, timeout)
    }

    /// Arm `edge` on `pin` and stream events from a dedicated polling thread.
    pub fn subscribe(self: &Arc<Self>, pin: u32, edge: EdgeMode) -> Result<EdgeSubscription, GPIOError> {
        if edge == EdgeMode::None {
            return Err(GPIOError::InvalidParam("cannot subscribe without an edge".into()));
        }
        self.set_edge(pin, edge)?;
        Ok(EdgeSubscription::spawn(Arc::clone(self), pin))
    }

    /// Store a listener for `pin`. Edge waits do not dispatch to it.
    pub fn add_callback(&self, pin: u32, callback: EdgeCallback) -> Result<(), GPIOError> {
        let mut pins = self.pins();
        let state = pins.get_mut(&pin).ok_or(GPIOError::NotFound { pin })?;
        state.callback = Some(callback);
        Ok(())
    }

    pub fn remove_callback(&self, pin: u32) -> Result<(), GPIOError> {
        let mut pins = self.pins();
        let state = pins.get_mut(&pin).ok_or(GPIOError::NotFound { pin })?;
        state.callback = None;
        Ok(())
    }

    pub fn pin_state(&self, pin: u32) -> Option<PinState> {
        self.pins().get(&pin).cloned()
    }

    pub fn configured_pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.pins().keys().copied().collect();
        pins.sort_unstable();
        pins
    }
}
