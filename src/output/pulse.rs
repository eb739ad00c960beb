use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::output::driver::OutputDriver;
use crate::output::{OutputError, DEFAULT_PULSE_MS};

/// A scheduled OFF for a pulsed output.
pub struct PulseHandle {
    output: String,
    task: JoinHandle<Result<(), OutputError>>,
}

impl PulseHandle {
    /// Abort the pending OFF. The output is left ON.
    pub fn cancel(&self) {
        debug!("{}: pulse cancelled", self.output);
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the OFF to be applied. A cancelled pulse resolves to `Ok`.
    pub async fn wait(self) -> Result<(), OutputError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        }
    }
}

impl OutputDriver {
    fn pulse_duration(&self, duration_ms: Option<u32>) -> Duration {
        let millis = duration_ms
            .filter(|ms| *ms > 0)
            .or(Some(self.config().pulse_ms).filter(|ms| *ms > 0))
            .unwrap_or(DEFAULT_PULSE_MS);
        Duration::from_millis(u64::from(millis))
    }

    /// Turn ON now and schedule the OFF on the current tokio runtime.
    ///
    /// A later pulse, or any accepted set, toggle, PWM or stop command, replaces
    /// the scheduled OFF.
    pub fn pulse(self: &Arc<Self>, duration_ms: Option<u32>) -> Result<PulseHandle, OutputError> {
        let runtime = Handle::try_current()
            .map_err(|_| OutputError::NotInitialized("pulse needs a running tokio runtime".into()))?;
        let duration = self.pulse_duration(duration_ms);
        let driver = Arc::downgrade(self);
        let task = self.start_pulse(|seq| {
            runtime.spawn(async move {
                tokio::time::sleep(duration).await;
                let Some(driver) = driver.upgrade() else {
                    return Ok(());
                };
                let result = driver.finish_pulse(seq);
                if let Err(err) = &result {
                    warn!("{}: pulse failed to switch off: {}", driver.name(), err);
                }
                result
            })
        })?;
        debug!("{}: pulsing for {}ms", self.name(), duration.as_millis());
        Ok(PulseHandle {
            output: self.name().to_owned(),
            task,
        })
    }

    /// Turn ON, sleep on the calling thread, turn OFF.
    pub fn pulse_blocking(&self, duration_ms: Option<u32>) -> Result<(), OutputError> {
        let duration = self.pulse_duration(duration_ms);
        self.set(true)?;
        std::thread::sleep(duration);
        self.set(false)
    }
}
