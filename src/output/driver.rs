use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::task::{AbortHandle, JoinHandle};

use crate::io::gpio::registry::GPIORegistry;
use crate::io::gpio::{GPIOMode, Pull};
use crate::output::interlock::{InterlockRegistry, InterlockToken};
use crate::output::{
    LockoutReason, OutputConfig, OutputError, OutputState, OutputStatus, OutputType, DIGITAL_ON_THRESHOLD,
    PWM_ON_THRESHOLD,
};
use crate::time_util::mytime::{millis_since, TimeProvider};

/// Drives one actuator.
///
/// All state changes run under the status lock, so concurrent calls on the
/// same driver serialise. Lock order is status, then interlock or GPIO, never
/// both of the latter at once.
pub struct OutputDriver {
    config: OutputConfig,
    gpio: Arc<GPIORegistry>,
    interlocks: Arc<InterlockRegistry>,
    clock: Arc<dyn TimeProvider>,
    token: Arc<InterlockToken>,
    status: Mutex<Tracked>,
}

/// Reported status plus the monotonic marks the timing gates run on.
#[derive(Default)]
struct Tracked {
    status: OutputStatus,
    on_since: Option<Instant>,
    off_since: Option<Instant>,
    pulse: Option<PendingPulse>,
    pulses_started: u64,
}

struct PendingPulse {
    seq: u64,
    abort: AbortHandle,
}

impl Tracked {
    /// Drop the scheduled OFF of an earlier pulse, if any.
    fn cancel_pulse(&mut self) {
        if let Some(pending) = self.pulse.take() {
            pending.abort.abort();
        }
    }
}

impl OutputDriver {
    /// Claim the pin as an output, de-energised.
    pub fn new(
        config: OutputConfig,
        gpio: Arc<GPIORegistry>,
        interlocks: Arc<InterlockRegistry>,
        clock: Arc<dyn TimeProvider>,
    ) -> Result<Self, OutputError> {
        config.validate()?;
        if config.chip != gpio.chip() {
            return Err(OutputError::InvalidParam(format!(
                "{} is on {} but the GPIO registry drives {}",
                config.name,
                config.chip,
                gpio.chip()
            )));
        }
        gpio.configure(
            config.pin,
            GPIOMode::Output {
                initial: config.electrical_level(false),
            },
            Pull::Disabled,
        )?;
        if let Some(group) = config.interlock_group {
            interlocks.register(group);
        }
        info!(
            "Created {} output '{}' on {} pin {}{}",
            config.output_type,
            config.name,
            config.chip,
            config.pin,
            if config.active_low { " (active low)" } else { "" }
        );
        Ok(Self {
            token: InterlockToken::new(config.id, &config.name),
            config,
            gpio,
            interlocks,
            clock,
            status: Mutex::new(Tracked::default()),
        })
    }

    fn lock_status(&self) -> MutexGuard<'_, Tracked> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> i64 {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    pub fn status(&self) -> OutputStatus {
        self.lock_status().status.clone()
    }

    pub fn is_on(&self) -> bool {
        self.lock_status().status.is_on()
    }

    /// Carry persisted counters across a restart.
    pub fn restore_counters(&self, total_on_time_ms: u64, cycle_count: u32) {
        let mut tracked = self.lock_status();
        tracked.status.total_on_time_ms = total_on_time_ms;
        tracked.status.cycle_count = cycle_count;
    }

    /// An accepted command supersedes any pulse still waiting to switch off.
    pub fn set(&self, on: bool) -> Result<(), OutputError> {
        let duty = self.full_duty(on);
        let mut tracked = self.lock_status();
        self.command(&mut tracked, on, duty)
    }

    pub fn toggle(&self) -> Result<(), OutputError> {
        let mut tracked = self.lock_status();
        let on = !tracked.status.is_on();
        self.command(&mut tracked, on, self.full_duty(on))
    }

    /// Non-PWM outputs switch at 50%; PWM outputs are clamped to their bounds.
    pub fn set_pwm(&self, duty: f32) -> Result<(), OutputError> {
        if !duty.is_finite() {
            return Err(OutputError::InvalidParam(format!("{}: duty {} is not a number", self.name(), duty)));
        }
        if self.config.output_type != OutputType::Pwm {
            return self.set(duty > DIGITAL_ON_THRESHOLD);
        }
        let duty = duty.clamp(self.config.pwm_min_duty, self.config.pwm_max_duty);
        let mut tracked = self.lock_status();
        self.command(&mut tracked, duty > PWM_ON_THRESHOLD, duty)
    }

    /// Query whether the interlock group would let this output turn ON now.
    pub fn check_interlock(&self) -> bool {
        match self.config.interlock_group {
            None => true,
            Some(group) => self.interlocks.is_available(group, &self.token),
        }
    }

    /// Enforce the maximum on-time. Meant to be called periodically.
    pub fn process(&self) -> Result<(), OutputError> {
        if self.config.max_on_time_sec == 0 {
            return Ok(());
        }
        let mut tracked = self.lock_status();
        let Some(on_since) = tracked.on_since.filter(|_| tracked.status.is_on()) else {
            return Ok(());
        };
        let limit_ms = u64::from(self.config.max_on_time_sec) * 1000;
        let on_for = millis_since(on_since, self.clock.get_monotonic());
        if on_for <= limit_ms {
            return Ok(());
        }
        warn!(
            "{}: on for {}ms (limit {}ms), shutting off",
            self.name(),
            on_for,
            limit_ms
        );
        self.force_off(&mut tracked, Some(LockoutReason::AutoShutoff))
    }

    /// De-energise immediately, ignoring every gate. The lockout holds until
    /// [reset_lockout](Self::reset_lockout).
    pub fn emergency_stop(&self) -> Result<(), OutputError> {
        let mut tracked = self.lock_status();
        warn!("{}: emergency stop", self.name());
        self.force_off(&mut tracked, Some(LockoutReason::EmergencyStop))
    }

    /// De-energise for a controlled stop, ignoring the timing gates. No lockout
    /// is set, and the on-time so far is added to the counters.
    pub fn shutdown(&self) -> Result<(), OutputError> {
        let mut tracked = self.lock_status();
        self.force_off(&mut tracked, None)
    }

    /// Clear the lockout without touching the output.
    pub fn reset_lockout(&self) {
        let mut tracked = self.lock_status();
        let status = &mut tracked.status;
        if let Some(reason) = status.lockout_reason {
            info!("{}: lockout '{}' cleared", self.name(), reason);
        }
        status.lockout = false;
        status.lockout_reason = None;
    }

    /// Switch ON and hand `schedule` the sequence number its OFF must present
    /// to [finish_pulse](Self::finish_pulse). Replaces any earlier pending pulse.
    pub(crate) fn start_pulse<T>(&self, schedule: impl FnOnce(u64) -> JoinHandle<T>) -> Result<JoinHandle<T>, OutputError> {
        let mut tracked = self.lock_status();
        self.command(&mut tracked, true, self.full_duty(true))?;
        tracked.pulses_started += 1;
        let seq = tracked.pulses_started;
        let task = schedule(seq);
        tracked.pulse = Some(PendingPulse {
            seq,
            abort: task.abort_handle(),
        });
        Ok(task)
    }

    /// The scheduled OFF of pulse `seq`. A no-op once something else has
    /// commanded the output since.
    pub(crate) fn finish_pulse(&self, seq: u64) -> Result<(), OutputError> {
        let mut tracked = self.lock_status();
        match &tracked.pulse {
            Some(pending) if pending.seq == seq => tracked.pulse = None,
            _ => {
                debug!("{}: pulse {} superseded", self.name(), seq);
                return Ok(());
            }
        }
        self.apply(&mut tracked, false, 0.0)
    }

    fn full_duty(&self, on: bool) -> f32 {
        match (on, self.config.output_type) {
            (false, _) => 0.0,
            (true, OutputType::Pwm) => self.config.pwm_max_duty,
            (true, _) => 1.0,
        }
    }

    fn command(&self, tracked: &mut Tracked, on: bool, duty: f32) -> Result<(), OutputError> {
        self.apply(tracked, on, duty)?;
        tracked.cancel_pulse();
        Ok(())
    }

    fn refuse(&self, status: &mut OutputStatus, reason: LockoutReason) -> Result<(), OutputError> {
        info!("{}: refused, {}", self.name(), reason);
        if status.latched_lockout().is_none() {
            status.set_lockout(reason);
        }
        Err(OutputError::Busy(reason))
    }

    fn apply(&self, tracked: &mut Tracked, on: bool, duty: f32) -> Result<(), OutputError> {
        let now = self.clock.get_monotonic();
        let was_on = tracked.status.is_on();

        if on {
            if let Some(reason) = tracked.status.latched_lockout() {
                return self.refuse(&mut tracked.status, reason);
            }
        }
        if on && !was_on && self.config.min_off_time_ms > 0 {
            if let Some(off_since) = tracked.off_since {
                if millis_since(off_since, now) < u64::from(self.config.min_off_time_ms) {
                    return self.refuse(&mut tracked.status, LockoutReason::MinOffTime);
                }
            }
        }
        if !on && was_on && self.config.min_on_time_ms > 0 {
            if let Some(on_since) = tracked.on_since {
                if millis_since(on_since, now) < u64::from(self.config.min_on_time_ms) {
                    return self.refuse(&mut tracked.status, LockoutReason::MinOnTime);
                }
            }
        }
        if on {
            if let Some(group) = self.config.interlock_group {
                if !self.interlocks.try_reserve(group, &self.token) {
                    return self.refuse(&mut tracked.status, LockoutReason::InterlockActive);
                }
            }
        }

        if let Err(err) = self.gpio.write(self.config.pin, self.config.electrical_level(on)) {
            if let (true, Some(group)) = (on, self.config.interlock_group) {
                self.interlocks.abandon(group, &self.token);
            }
            error!("{}: failed to switch {}: {}", self.name(), on_off(on), err);
            tracked.status.state = OutputState::Error;
            return Err(err.into());
        }

        if let Some(group) = self.config.interlock_group {
            if on {
                self.interlocks.confirm(group, &self.token);
            } else {
                self.interlocks.release(group, &self.token);
            }
        }

        tracked.status.clear_transient_lockout();
        tracked.status.pwm_duty = duty;
        if on != was_on {
            self.record_transition(tracked, on, now, self.clock.get_utc_time());
        }
        tracked.status.state = if on { OutputState::On } else { OutputState::Off };
        Ok(())
    }

    fn record_transition(&self, tracked: &mut Tracked, on: bool, now: Instant, wall: DateTime<Utc>) {
        if !on {
            if let Some(on_since) = tracked.on_since {
                tracked.status.total_on_time_ms += millis_since(on_since, now);
            }
        }
        let status = &mut tracked.status;
        status.last_change = Some(wall);
        status.cycle_count = status.cycle_count.saturating_add(1);
        if on {
            status.last_on = Some(wall);
            tracked.on_since = Some(now);
        } else {
            status.last_off = Some(wall);
            tracked.off_since = Some(now);
        }
        debug!("{}: {} (cycle {})", self.name(), on_off(on), tracked.status.cycle_count);
    }

    fn force_off(&self, tracked: &mut Tracked, reason: Option<LockoutReason>) -> Result<(), OutputError> {
        let now = self.clock.get_monotonic();
        let was_on = tracked.status.is_on();
        tracked.cancel_pulse();
        if let Some(reason) = reason {
            tracked.status.set_lockout(reason);
        }

        if let Err(err) = self.gpio.write(self.config.pin, self.config.electrical_level(false)) {
            // The group stays claimed: the output may still be energised.
            error!("{}: failed to de-energise: {}", self.name(), err);
            tracked.status.state = OutputState::Error;
            return Err(err.into());
        }
        if let Some(group) = self.config.interlock_group {
            self.interlocks.release(group, &self.token);
        }
        tracked.status.pwm_duty = 0.0;
        if was_on {
            self.record_transition(tracked, false, now, self.clock.get_utc_time());
        }
        tracked.status.state = OutputState::Off;
        Ok(())
    }
}

impl Drop for OutputDriver {
    fn drop(&mut self) {
        self.status.get_mut().unwrap_or_else(PoisonError::into_inner).cancel_pulse();
        let pin = self.config.pin;
        if let Err(err) = self.gpio.write(pin, self.config.electrical_level(false)) {
            error!("{}: failed to switch off on release: {}", self.config.name, err);
        }
        if let Some(group) = self.config.interlock_group {
            self.interlocks.release(group, &self.token);
        }
        if let Err(err) = self.gpio.release(pin) {
            warn!("{}: failed to release pin {}: {}", self.config.name, pin, err);
        }
        debug!("{}: released", self.config.name);
    }
}

fn on_off(on: bool) -> &'static str {
    if on { "On" } else { "Off" }
}
