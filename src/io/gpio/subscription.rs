use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::sync::mpsc::{self, Receiver};

use crate::io::gpio::registry::GPIORegistry;
use crate::io::gpio::{Edge, GPIOError};

/// How long each backend wait lasts before the cancel flag is rechecked.
const WAIT_SLICE: Duration = Duration::from_millis(50);
const CHANNEL_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeEvent {
    pub pin: u32,
    pub edge: Edge,
    pub at: DateTime<Utc>,
}

/// Stream of edges from one pin. Dropping it stops the polling thread.
pub struct EdgeSubscription {
    pin: u32,
    receiver: Receiver<EdgeEvent>,
    cancelled: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EdgeSubscription {
    pub(crate) fn spawn(registry: Arc<GPIORegistry>, pin: u32) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_SIZE);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);

        let thread = std::thread::Builder::new()
            .name(format!("edge-{}", pin))
            .spawn(move || {
                debug!("Edge poller for pin {} started", pin);
                while !flag.load(Ordering::Acquire) {
                    match registry.wait_edge(pin, WAIT_SLICE) {
                        Ok(edge) => {
                            let event = EdgeEvent { pin, edge, at: Utc::now() };
                            if sender.blocking_send(event).is_err() {
                                break;
                            }
                        }
                        Err(GPIOError::Timeout) => continue,
                        Err(err) => {
                            warn!("Edge poller for pin {} stopping: {}", pin, err);
                            break;
                        }
                    }
                }
                debug!("Edge poller for pin {} finished", pin);
            });

        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(err) => {
                warn!("Failed to start edge poller for pin {}: {}", pin, err);
                None
            }
        };

        Self {
            pin,
            receiver,
            cancelled,
            thread,
        }
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    /// `None` once the subscription is cancelled or the poller has stopped.
    pub async fn recv(&mut self) -> Option<EdgeEvent> {
        self.receiver.recv().await
    }

    /// Must not be called from within an async context.
    pub fn blocking_recv(&mut self) -> Option<EdgeEvent> {
        self.receiver.blocking_recv()
    }

    pub fn try_recv(&mut self) -> Option<EdgeEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Stop the poller and wait for it to exit (at most one wait slice).
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.receiver.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Edge poller for pin {} panicked", self.pin);
            }
        }
    }
}

impl Drop for EdgeSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::gpio::dummy::Dummy;
    use crate::io::gpio::{EdgeMode, GPIOMode, Pull};

    fn input_registry() -> (Arc<GPIORegistry>, Dummy) {
        let dummy = Dummy::new();
        let registry = Arc::new(GPIORegistry::new(Box::new(dummy.clone()), "gpiochip0", None));
        registry.init().unwrap();
        registry.configure(22, GPIOMode::Input, Pull::Disabled).unwrap();
        (registry, dummy)
    }

    #[test]
    fn forwards_edges_until_cancelled() {
        let (registry, dummy) = input_registry();
        let mut subscription = registry.subscribe(22, EdgeMode::Both).unwrap();

        dummy.inject_level(22, true);
        let event = subscription.blocking_recv().unwrap();
        assert_eq!(event.pin, 22);
        assert_eq!(event.edge, Edge::Rising);

        dummy.inject_level(22, false);
        assert_eq!(subscription.blocking_recv().unwrap().edge, Edge::Falling);

        subscription.cancel();
        assert!(subscription.is_cancelled());
        dummy.inject_level(22, true);
        assert_eq!(subscription.blocking_recv(), None);
    }

    #[test]
    fn poller_stops_when_pin_is_released() {
        let (registry, _) = input_registry();
        let mut subscription = registry.subscribe(22, EdgeMode::Rising).unwrap();
        registry.release(22).unwrap();
        assert_eq!(subscription.blocking_recv(), None);
    }

    #[test]
    fn subscribe_requires_an_edge() {
        let (registry, _) = input_registry();
        assert!(registry.subscribe(22, EdgeMode::None).is_err());
    }
}
