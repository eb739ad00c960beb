use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::debug;

use crate::io::gpio::{Edge, EdgeMode, GPIOBackend, GPIOError, GPIOMode, Pull};

/// In-memory backend. Clones share the same pins, so a test can keep a handle
/// to inject input levels and write faults after handing a clone to a registry.
#[derive(Clone, Default)]
pub struct Dummy {
    inner: Arc<DummyInner>,
}

#[derive(Default)]
struct DummyInner {
    initialised: AtomicBool,
    pins: Mutex<HashMap<u32, DummyPin>>,
    edge_signal: Condvar,
    failing: Mutex<HashSet<u32>>,
    written: Mutex<HashMap<u32, Vec<bool>>>,
}

#[derive(Debug)]
struct DummyPin {
    mode: GPIOMode,
    pull: Pull,
    level: bool,
    edge: EdgeMode,
    pending: VecDeque<Edge>,
}

impl Dummy {
    pub fn new() -> Self {
        Self::default()
    }

    fn pins(&self) -> MutexGuard<'_, HashMap<u32, DummyPin>> {
        self.inner.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drive an external level onto a pin, queueing an edge if one is armed.
    pub fn inject_level(&self, pin: u32, level: bool) {
        let mut pins = self.pins();
        if let Some(state) = pins.get_mut(&pin) {
            if let Some(edge) = Edge::between(state.level, level) {
                if state.edge.accepts(edge) {
                    state.pending.push_back(edge);
                    self.inner.edge_signal.notify_all();
                }
            }
            state.level = level;
        }
    }

    /// Make every subsequent write to `pin` fail with an I/O error.
    pub fn fail_writes(&self, pin: u32, failing: bool) {
        let mut set = self.inner.failing.lock().unwrap_or_else(PoisonError::into_inner);
        if failing {
            set.insert(pin);
        } else {
            set.remove(&pin);
        }
    }

    /// Current electrical level of a configured pin.
    pub fn level(&self, pin: u32) -> Option<bool> {
        self.pins().get(&pin).map(|state| state.level)
    }

    /// Every level successfully written to `pin`, surviving release.
    pub fn writes(&self, pin: u32) -> Vec<bool> {
        let written = self.inner.written.lock().unwrap_or_else(PoisonError::into_inner);
        written.get(&pin).cloned().unwrap_or_default()
    }

    pub fn mode(&self, pin: u32) -> Option<GPIOMode> {
        self.pins().get(&pin).map(|state| state.mode)
    }

    pub fn pull(&self, pin: u32) -> Option<Pull> {
        self.pins().get(&pin).map(|state| state.pull)
    }

    pub fn is_configured(&self, pin: u32) -> bool {
        self.pins().contains_key(&pin)
    }

    fn ensure_initialised(&self) -> Result<(), GPIOError> {
        if self.inner.initialised.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(GPIOError::NotInitialized)
        }
    }
}

impl GPIOBackend for Dummy {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn init(&self) -> Result<(), GPIOError> {
        self.inner.initialised.store(true, Ordering::Release);
        Ok(())
    }

    fn shutdown(&self) {
        self.pins().clear();
        self.inner.initialised.store(false, Ordering::Release);
        self.inner.edge_signal.notify_all();
    }

    fn is_initialised(&self) -> bool {
        self.inner.initialised.load(Ordering::Acquire)
    }

    fn configure(&self, pin: u32, mode: GPIOMode, pull: Pull) -> Result<(), GPIOError> {
        self.ensure_initialised()?;
        let level = match mode {
            GPIOMode::Output { initial } => initial,
            GPIOMode::Input => pull == Pull::Up,
        };
        debug!("Dummy: configuring pin {} as {:?} ({:?})", pin, mode, pull);
        self.pins().insert(
            pin,
            DummyPin {
                mode,
                pull,
                level,
                edge: EdgeMode::None,
                pending: VecDeque::new(),
            },
        );
        Ok(())
    }

    fn release(&self, pin: u32) -> Result<(), GPIOError> {
        self.pins()
            .remove(&pin)
            .map(|_| ())
            .ok_or(GPIOError::NotFound { pin })
    }

    fn read(&self, pin: u32) -> Result<bool, GPIOError> {
        self.pins()
            .get(&pin)
            .map(|state| state.level)
            .ok_or(GPIOError::NotFound { pin })
    }

    fn write(&self, pin: u32, value: bool) -> Result<(), GPIOError> {
        if self.inner.failing.lock().unwrap_or_else(PoisonError::into_inner).contains(&pin) {
            return Err(GPIOError::other(format!("injected write fault on pin {}", pin)));
        }
        let mut pins = self.pins();
        let state = pins.get_mut(&pin).ok_or(GPIOError::NotFound { pin })?;
        debug!("Dummy: setting pin {} to {}", pin, if value { "HIGH" } else { "LOW" });
        state.level = value;
        drop(pins);
        let mut written = self.inner.written.lock().unwrap_or_else(PoisonError::into_inner);
        written.entry(pin).or_default().push(value);
        Ok(())
    }

    fn set_edge(&self, pin: u32, edge: EdgeMode) -> Result<(), GPIOError> {
        let mut pins = self.pins();
        let state = pins.get_mut(&pin).ok_or(GPIOError::NotFound { pin })?;
        state.edge = edge;
        state.pending.clear();
        Ok(())
    }

    fn wait_edge(&self, pin: u32, timeout: Duration) -> Result<Edge, GPIOError> {
        let deadline = Instant::now() + timeout;
        let mut pins = self.pins();
        loop {
            let state = pins.get_mut(&pin).ok_or(GPIOError::NotFound { pin })?;
            if let Some(edge) = state.pending.pop_front() {
                return Ok(edge);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(GPIOError::Timeout);
            }
            pins = self
                .inner
                .edge_signal
                .wait_timeout(pins, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ready() -> Dummy {
        let dummy = Dummy::new();
        dummy.init().unwrap();
        dummy
    }

    #[test]
    fn configure_before_init_fails() {
        let dummy = Dummy::new();
        let result = dummy.configure(4, GPIOMode::Input, Pull::Disabled);
        assert!(matches!(result, Err(GPIOError::NotInitialized)));
    }

    #[test]
    fn unknown_pin_is_not_found() {
        let dummy = ready();
        assert!(matches!(dummy.read(9), Err(GPIOError::NotFound { pin: 9 })));
        assert!(matches!(dummy.write(9, true), Err(GPIOError::NotFound { pin: 9 })));
    }

    #[test]
    fn output_starts_at_initial_level() {
        let dummy = ready();
        dummy.configure(5, GPIOMode::Output { initial: true }, Pull::Disabled).unwrap();
        assert_eq!(dummy.read(5).unwrap(), true);
        dummy.write(5, false).unwrap();
        assert_eq!(dummy.level(5), Some(false));
    }

    #[test]
    fn injected_write_fault() {
        let dummy = ready();
        dummy.configure(5, GPIOMode::Output { initial: false }, Pull::Disabled).unwrap();
        dummy.fail_writes(5, true);
        assert!(matches!(dummy.write(5, true), Err(GPIOError::Io(_))));
        dummy.fail_writes(5, false);
        dummy.write(5, true).unwrap();
    }

    #[test]
    fn wait_edge_times_out() {
        let dummy = ready();
        dummy.configure(6, GPIOMode::Input, Pull::Disabled).unwrap();
        dummy.set_edge(6, EdgeMode::Both).unwrap();
        let result = dummy.wait_edge(6, Duration::from_millis(20));
        assert!(matches!(result, Err(GPIOError::Timeout)));
    }

    #[test]
    fn wait_edge_wakes_on_injected_level() {
        let dummy = ready();
        dummy.configure(6, GPIOMode::Input, Pull::Disabled).unwrap();
        dummy.set_edge(6, EdgeMode::Falling).unwrap();

        let injector = dummy.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            injector.inject_level(6, true);
            injector.inject_level(6, false);
        });

        let edge = dummy.wait_edge(6, Duration::from_secs(2)).unwrap();
        assert_eq!(edge, Edge::Falling);
        handle.join().unwrap();
    }
}
