use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use gpiocdev::chip::Chip;
use gpiocdev::line::{Bias, EdgeDetection, EdgeKind, Value};
use gpiocdev::Request;
use log::{debug, warn};

use crate::io::gpio::{Edge, EdgeMode, GPIOBackend, GPIOError, GPIOMode, Pull};

/// Longest a waiter sits in `poll(2)` before checking whether its line was retired.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Character-device backend: every pin is a single line request on the chip,
/// carrying direction, bias and edge detection together.
///
/// Edge waits poll the request's fd without holding any lock. Reconfiguring or
/// releasing a line retires its request and waits for in-flight waiters to let
/// go of it before the kernel is asked for a new one.
pub struct CDevGPIO {
    chip_path: PathBuf,
    consumer: String,
    initialised: AtomicBool,
    lines: Mutex<HashMap<u32, Line>>,
    /// Signalled by waiters as they drop their share of a request.
    waiter_left: Condvar,
}

struct Line {
    mode: GPIOMode,
    pull: Pull,
    edge: EdgeMode,
    binding: Arc<Binding<Request>>,
}

/// A line request shared with the waiters blocked on it.
struct Binding<T> {
    handle: T,
    retired: AtomicBool,
}

impl<T> Binding<T> {
    fn new(handle: T) -> Arc<Self> {
        Arc::new(Self {
            handle,
            retired: AtomicBool::new(false),
        })
    }
}

impl CDevGPIO {
    pub fn new(chip_path: PathBuf, consumer: &str) -> CDevGPIO {
        CDevGPIO {
            chip_path,
            consumer: consumer.to_owned(),
            initialised: AtomicBool::new(false),
            lines: Mutex::new(HashMap::new()),
            waiter_left: Condvar::new(),
        }
    }

    fn lines(&self) -> MutexGuard<'_, HashMap<u32, Line>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn binding(&self, pin: u32) -> Result<(GPIOMode, EdgeMode, Arc<Binding<Request>>), GPIOError> {
        self.lines()
            .get(&pin)
            .map(|line| (line.mode, line.edge, Arc::clone(&line.binding)))
            .ok_or(GPIOError::NotFound { pin })
    }

    fn request(&self, pin: u32, mode: GPIOMode, pull: Pull, edge: EdgeMode) -> Result<Request, GPIOError> {
        let mut builder = Request::builder();
        builder
            .on_chip(self.chip_path.clone())
            .with_consumer(&self.consumer)
            .with_line(pin)
            .with_bias(bias(pull));
        match mode {
            GPIOMode::Input => {
                builder.as_input();
                if let Some(detection) = edge_detection(edge) {
                    builder.with_edge_detection(detection);
                }
            }
            GPIOMode::Output { initial } => {
                builder.as_output(value(initial));
            }
        }
        builder.request().map_err(map_cdev_err)
    }
}

impl GPIOBackend for CDevGPIO {
    fn name(&self) -> &'static str {
        "cdev"
    }

    fn init(&self) -> Result<(), GPIOError> {
        if self.is_initialised() {
            return Ok(());
        }
        let chip = Chip::from_path(&self.chip_path).map_err(map_cdev_err)?;
        let info = chip.info().map_err(map_cdev_err)?;
        debug!("Opened {} ({} lines)", self.chip_path.display(), info.num_lines);
        self.initialised.store(true, Ordering::Release);
        Ok(())
    }

    fn shutdown(&self) {
        let mut lines = self.lines();
        let retiring: Vec<Line> = lines.drain().map(|(_, line)| line).collect();
        for line in retiring {
            lines = retire(&self.waiter_left, lines, line.binding);
        }
        self.initialised.store(false, Ordering::Release);
    }

    fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::Acquire)
    }

    fn configure(&self, pin: u32, mode: GPIOMode, pull: Pull) -> Result<(), GPIOError> {
        if !self.is_initialised() {
            return Err(GPIOError::NotInitialized);
        }
        let mut lines = self.lines();
        // The kernel refuses a second request for a busy line, so the old handle goes first.
        if let Some(previous) = lines.remove(&pin) {
            lines = retire(&self.waiter_left, lines, previous.binding);
        }
        let request = self.request(pin, mode, pull, EdgeMode::None)?;
        lines.insert(
            pin,
            Line {
                mode,
                pull,
                edge: EdgeMode::None,
                binding: Binding::new(request),
            },
        );
        Ok(())
    }

    fn release(&self, pin: u32) -> Result<(), GPIOError> {
        let mut lines = self.lines();
        let line = lines.remove(&pin).ok_or(GPIOError::NotFound { pin })?;
        drop(retire(&self.waiter_left, lines, line.binding));
        Ok(())
    }

    fn read(&self, pin: u32) -> Result<bool, GPIOError> {
        let (_, _, binding) = self.binding(pin)?;
        let level = binding.handle.value(pin).map_err(map_cdev_err)?;
        Ok(level == Value::Active)
    }

    fn write(&self, pin: u32, level: bool) -> Result<(), GPIOError> {
        let (mode, _, binding) = self.binding(pin)?;
        if !mode.is_output() {
            return Err(GPIOError::PinInIncorrectMode { pin, required: "an output" });
        }
        binding.handle.set_value(pin, value(level)).map_err(map_cdev_err)?;
        Ok(())
    }

    fn set_edge(&self, pin: u32, edge: EdgeMode) -> Result<(), GPIOError> {
        let mut lines = self.lines();
        let line = lines.remove(&pin).ok_or(GPIOError::NotFound { pin })?;
        if line.mode.is_output() {
            lines.insert(pin, line);
            return Err(GPIOError::PinInIncorrectMode { pin, required: "an input" });
        }
        let Line { mode, pull, binding, .. } = line;
        lines = retire(&self.waiter_left, lines, binding);

        let (request, armed, result) = arm_or_fall_back(
            pin,
            edge,
            || self.request(pin, mode, pull, edge),
            || self.request(pin, mode, pull, EdgeMode::None),
        )?;
        lines.insert(
            pin,
            Line {
                mode,
                pull,
                edge: armed,
                binding: Binding::new(request),
            },
        );
        result
    }

    fn wait_edge(&self, pin: u32, timeout: Duration) -> Result<Edge, GPIOError> {
        let (_, edge, binding) = self.binding(pin)?;
        if edge == EdgeMode::None {
            return Err(GPIOError::InvalidParam(format!("edge detection is not armed on pin {}", pin)));
        }
        let fd = binding.handle.as_raw_fd();
        let result = wait_ready(&binding.retired, Instant::now() + timeout, |slice| poll_readable(fd, slice))
            .and_then(|()| binding.handle.read_edge_event().map_err(map_cdev_err))
            .map(|event| match event.kind {
                EdgeKind::Rising => Edge::Rising,
                EdgeKind::Falling => Edge::Falling,
            });
        drop(binding);
        let _lines = self.lines();
        self.waiter_left.notify_all();
        result
    }
}

/// Request the line with `edge` armed. If the kernel refuses, take the line
/// back as a plain input so it stays readable, and report the arming error
/// alongside it.
fn arm_or_fall_back<R>(
    pin: u32,
    edge: EdgeMode,
    arm: impl FnOnce() -> Result<R, GPIOError>,
    plain: impl FnOnce() -> Result<R, GPIOError>,
) -> Result<(R, EdgeMode, Result<(), GPIOError>), GPIOError> {
    match arm() {
        Ok(request) => Ok((request, edge, Ok(()))),
        Err(err) => {
            warn!("Pin {}: arming {:?} edges failed, falling back to a plain input: {}", pin, edge, err);
            Ok((plain()?, EdgeMode::None, Err(err)))
        }
    }
}

/// Mark `binding` retired and block until no waiter still shares it, then
/// drop it. `lines` is released while waiting so waiters can report back.
fn retire<'a, T>(
    waiter_left: &Condvar,
    mut lines: MutexGuard<'a, HashMap<u32, Line>>,
    mut binding: Arc<Binding<T>>,
) -> MutexGuard<'a, HashMap<u32, Line>> {
    binding.retired.store(true, Ordering::Release);
    loop {
        match Arc::try_unwrap(binding) {
            Ok(owned) => {
                drop(owned);
                return lines;
            }
            Err(shared) => {
                binding = shared;
                lines = waiter_left
                    .wait_timeout(lines, WAIT_SLICE)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
    }
}

/// Poll in slices until `poll` reports readiness, the deadline passes or the
/// line is retired. A slice that ends early (a signal) is retried with the
/// time that is left.
fn wait_ready(
    retired: &AtomicBool,
    deadline: Instant,
    mut poll: impl FnMut(Duration) -> Result<bool, GPIOError>,
) -> Result<(), GPIOError> {
    loop {
        if retired.load(Ordering::Acquire) {
            return Err(GPIOError::other("line was reconfigured while waiting for an edge"));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(GPIOError::Timeout);
        }
        if poll(remaining.min(WAIT_SLICE))? {
            return Ok(());
        }
    }
}

/// `Ok(false)` on timeout or when interrupted by a signal.
fn poll_readable(fd: RawFd, timeout: Duration) -> Result<bool, GPIOError> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN | libc::POLLPRI,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `pollfd` is a valid, exclusively borrowed array of length 1.
    let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };
    if ready < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err.into());
    }
    Ok(ready > 0)
}

fn bias(pull: Pull) -> Bias {
    match pull {
        Pull::Disabled => Bias::Disabled,
        Pull::Up => Bias::PullUp,
        Pull::Down => Bias::PullDown,
    }
}

fn edge_detection(edge: EdgeMode) -> Option<EdgeDetection> {
    match edge {
        EdgeMode::None => None,
        EdgeMode::Rising => Some(EdgeDetection::RisingEdge),
        EdgeMode::Falling => Some(EdgeDetection::FallingEdge),
        EdgeMode::Both => Some(EdgeDetection::BothEdges),
    }
}

fn value(level: bool) -> Value {
    if level {
        Value::Active
    } else {
        Value::Inactive
    }
}

fn map_cdev_err(err: gpiocdev::Error) -> GPIOError {
    GPIOError::other(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::gpio::ErrorKind;

    #[test]
    fn pull_maps_to_bias() {
        assert_eq!(bias(Pull::Up), Bias::PullUp);
        assert_eq!(bias(Pull::Down), Bias::PullDown);
        assert_eq!(bias(Pull::Disabled), Bias::Disabled);
        assert_eq!(edge_detection(EdgeMode::None), None);
        assert_eq!(edge_detection(EdgeMode::Both), Some(EdgeDetection::BothEdges));
    }

    #[test]
    fn configure_before_init_fails() {
        let gpio = CDevGPIO::new(PathBuf::from("/dev/gpiochip-missing"), "test");
        let err = gpio.configure(4, GPIOMode::Input, Pull::Up).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    #[test_log::test]
    fn failed_edge_request_keeps_line_as_input() {
        let (line, armed, result) = arm_or_fall_back(
            4,
            EdgeMode::Both,
            || Err(GPIOError::other("EBUSY")),
            || Ok("plain input"),
        )
        .unwrap();
        assert_eq!(line, "plain input");
        assert_eq!(armed, EdgeMode::None);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::IoError);

        let (_, armed, result) = arm_or_fall_back(4, EdgeMode::Rising, || Ok("events"), || Ok("plain input")).unwrap();
        assert_eq!(armed, EdgeMode::Rising);
        assert!(result.is_ok());
    }

    #[test]
    fn interrupted_poll_keeps_waiting() {
        let retired = AtomicBool::new(false);
        let mut polls = 0;
        let result = wait_ready(&retired, Instant::now() + Duration::from_secs(5), |_| {
            polls += 1;
            // First two slices return early as if a signal arrived.
            Ok(polls > 2)
        });
        assert!(result.is_ok());
        assert_eq!(polls, 3);
    }

    #[test]
    fn wait_times_out_at_deadline() {
        let retired = AtomicBool::new(false);
        let started = Instant::now();
        let err = wait_ready(&retired, started + Duration::from_millis(60), |slice| {
            std::thread::sleep(slice);
            Ok(false)
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test_log::test]
    fn retire_waits_for_blocked_waiter() {
        let lines: Mutex<HashMap<u32, Line>> = Mutex::new(HashMap::new());
        let waiter_left = Arc::new(Condvar::new());
        let binding = Binding::new(std::fs::File::open("/dev/null").unwrap());

        let waiter = {
            let binding = Arc::clone(&binding);
            let waiter_left = Arc::clone(&waiter_left);
            std::thread::spawn(move || {
                let result = wait_ready(&binding.retired, Instant::now() + Duration::from_secs(10), |slice| {
                    std::thread::sleep(slice);
                    Ok(false)
                });
                drop(binding);
                waiter_left.notify_all();
                result
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let guard = retire(&waiter_left, lines.lock().unwrap(), binding);
        drop(guard);
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
    }
}
