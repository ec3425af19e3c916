use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, trace};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::PinValue;
use crate::error::{GpioError, Result};
use crate::gpio::{GpioPlatform, Shared};
use crate::poller::{Multiplexer, Readiness};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinEvent {
    pub pin: u32,
    /// Level read back right after the edge.
    pub value: PinValue,
    pub timestamp_ms: u64,
}

impl PinEvent {
    pub fn new(pin: u32, value: PinValue) -> Self {
        Self {
            pin,
            value,
            timestamp_ms: epoch_millis(),
        }
    }
}

pub struct EventDispatcher {
    event_tx: broadcast::Sender<PinEvent>,
    event_history: FxHashMap<u32, RwLock<VecDeque<PinEvent>>>,
    event_history_capacity: usize,
}

impl EventDispatcher {
    pub fn new(
        event_tx: broadcast::Sender<PinEvent>,
        pin_count: u32,
        event_history_capacity: usize,
    ) -> Self {
        let event_history = (0..pin_count)
            .map(|pin| (pin, RwLock::new(VecDeque::new())))
            .collect();
        Self {
            event_tx,
            event_history,
            event_history_capacity,
        }
    }

    pub fn dispatch(&self, event: PinEvent) {
        if self.event_history_capacity > 0 {
            if let Some(history_lock) = self.event_history.get(&event.pin) {
                let mut history = history_lock.write();
                while history.len() >= self.event_history_capacity {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }
        trace!("gpio{} changed to {:?}", event.pin, event.value);
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PinEvent> {
        self.event_tx.subscribe()
    }

    pub fn history(&self, pin: u32, limit: Option<usize>) -> Vec<PinEvent> {
        self.event_history
            .get(&pin)
            .map(|d| {
                let history = d.read();
                let skip = limit.map_or(0, |lim| history.len().saturating_sub(lim));
                history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn last(&self, pin: u32) -> Option<PinEvent> {
        self.event_history
            .get(&pin)
            .and_then(|d| d.read().back().cloned())
    }

    pub fn clear(&self, pin: u32) {
        if let Some(history) = self.event_history.get(&pin) {
            history.write().clear();
        }
    }
}

pub type EventHandler = Arc<EventDispatcher>;

/// Debounce filter: accepts an edge only if more than `debounce` passed since
/// the last accepted one, and records `now` when it does.
pub fn debounce_accepts(
    debounce: Duration,
    last_event: &mut Option<Instant>,
    now: Instant,
) -> bool {
    let accept = debounce.is_zero()
        || last_event.is_none_or(|last| now.saturating_duration_since(last) > debounce);
    if accept {
        *last_event = Some(now);
    }
    accept
}

pub(crate) fn spawn_worker<P: GpioPlatform + 'static>(
    shared: Arc<Shared<P>>,
    mux: Multiplexer,
    generation: u64,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("gpio-events-{generation}"))
        .spawn(move || EventDetectionLoop::new(shared, mux, generation).run())
        .map_err(|e| GpioError::io("spawn event detection worker", e))
}

/// Background worker waiting on the shared multiplexer while any pin is
/// subscribed.
struct EventDetectionLoop<P: GpioPlatform> {
    shared: Arc<Shared<P>>,
    mux: Multiplexer,
    generation: u64,
}

impl<P: GpioPlatform> EventDetectionLoop<P> {
    fn new(shared: Arc<Shared<P>>, mux: Multiplexer, generation: u64) -> Self {
        Self {
            shared,
            mux,
            generation,
        }
    }

    fn run(self) {
        debug!("event detection worker {} started", self.generation);
        while self.shared.worker_is_current(self.generation) {
            let readiness = match self.shared.poller().wait(&self.mux, -1) {
                Ok(readiness) => readiness,
                Err(e) => {
                    error!("event detection worker {} stopped: {e}", self.generation);
                    self.shared.abandon_worker(self.generation);
                    return;
                }
            };
            match readiness {
                Readiness::Pin(pin) => self.shared.handle_edge(pin),
                Readiness::Woken | Readiness::Timeout => {}
            }
        }
        debug!("event detection worker {} exiting", self.generation);
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
