use std::mem;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::{DriverConfig, EdgeDetect, NumberingScheme, PinEventTypes, PinMode, PinValue};
use crate::error::{GpioError, Result};
use crate::events::{self, EventDispatcher, EventHandler, PinEvent, debounce_accepts};
use crate::poller::{EdgePoller, Multiplexer, Readiness};
use crate::sysfs::SysfsPinAccessor;
use crate::table::{PinRecord, PinTable};

/// Both ends of the pipe used to interrupt a blocked multiplexer wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakerFds {
    pub read: RawFd,
    pub write: RawFd,
}

/// Raw file and kernel readiness surface the driver is built on.
pub trait GpioPlatform: Send + Sync {
    fn path_exists(&self, path: &Path) -> bool;
    fn read_to_string(&self, path: &Path) -> Result<String>;
    fn write_str(&self, path: &Path, contents: &str) -> Result<()>;

    fn open_nonblocking_read(&self, path: &Path) -> Result<RawFd>;
    fn close(&self, fd: RawFd) -> Result<()>;
    fn seek_to_start(&self, fd: RawFd) -> Result<()>;
    /// Reads exactly one byte; anything shorter is an error.
    fn read_byte(&self, fd: RawFd) -> Result<u8>;

    fn create_multiplexer(&self) -> Result<RawFd>;
    /// Edge-triggered interest in readable or priority data, tagged with `token`.
    fn register_edge(&self, mux: RawFd, fd: RawFd, token: u64) -> Result<()>;
    fn deregister(&self, mux: RawFd, fd: RawFd) -> Result<()>;
    /// Returns the token of one ready registration, or `None` on timeout.
    fn wait_ready(&self, mux: RawFd, timeout_ms: i32) -> Result<Option<u64>>;

    fn create_waker(&self) -> Result<WakerFds>;
    fn wake(&self, waker: &WakerFds) -> Result<()>;
}

pub(crate) enum WorkerState {
    Idle,
    Running {
        generation: u64,
        handle: JoinHandle<()>,
    },
}

pub(crate) struct DriverState {
    pub(crate) table: PinTable,
    pub(crate) multiplexer: Option<Multiplexer>,
    pub(crate) subscribed: usize,
    pub(crate) worker: WorkerState,
    next_generation: u64,
}

pub(crate) struct Shared<P: GpioPlatform> {
    pub(crate) platform: Arc<P>,
    pub(crate) config: DriverConfig,
    pub(crate) sysfs: SysfsPinAccessor,
    pub(crate) state: Mutex<DriverState>,
    pub(crate) events: EventHandler,
}

impl<P: GpioPlatform> Shared<P> {
    pub(crate) fn poller(&self) -> EdgePoller<'_, P> {
        EdgePoller::new(self.platform.as_ref())
    }

    pub(crate) fn worker_is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        matches!(state.worker, WorkerState::Running { generation: g, .. } if g == generation)
            && state.subscribed > 0
    }

    /// Marks the worker of `generation` as gone after it gave up on its
    /// multiplexer. The next enable starts a fresh one.
    pub(crate) fn abandon_worker(&self, generation: u64) {
        let mut state = self.state.lock();
        if matches!(state.worker, WorkerState::Running { generation: g, .. } if g == generation) {
            state.worker = WorkerState::Idle;
        }
    }

    /// Consumes an edge reported for `pin` by the shared multiplexer and
    /// dispatches it unless filtered.
    pub(crate) fn handle_edge(&self, pin: u32) {
        let mut state = self.state.lock();
        let Ok(record) = state.table.get_mut(pin) else {
            warn!("edge reported for unknown gpio{pin}");
            return;
        };
        let Some(fd) = record.value_fd.filter(|_| record.events_enabled) else {
            trace!("edge for gpio{pin} after it was unsubscribed");
            return;
        };

        let value = match self.poller().consume(fd) {
            Ok(value) => value,
            Err(e) => {
                warn!("failed to read edge on gpio{pin}: {e}");
                return;
            }
        };
        if mem::take(&mut record.swallow_initial) {
            trace!("swallowed initial readiness of gpio{pin}");
            return;
        }
        if !debounce_accepts(record.debounce, &mut record.last_event, Instant::now()) {
            trace!("debounced edge on gpio{pin}");
            return;
        }
        drop(state);

        self.events.dispatch(PinEvent::new(pin, value));
    }
}

/// sysfs GPIO driver with epoll based edge detection.
pub struct GpioDriver<P: GpioPlatform + 'static> {
    shared: Arc<Shared<P>>,
}

#[cfg(feature = "linux-sysfs")]
impl GpioDriver<crate::backend::LinuxPlatform> {
    /// Driver over the real `/sys/class/gpio` (or `config.sysfs_root`).
    pub fn new(config: DriverConfig) -> Result<Self> {
        Self::with_platform(config, Arc::new(crate::backend::LinuxPlatform::new()))
    }
}

impl<P: GpioPlatform + 'static> GpioDriver<P> {
    pub fn with_platform(config: DriverConfig, platform: Arc<P>) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        let events = Arc::new(EventDispatcher::new(
            event_tx,
            config.pin_count,
            config.event_history_capacity,
        ));
        let state = DriverState {
            table: PinTable::new(config.pin_count),
            multiplexer: None,
            subscribed: 0,
            worker: WorkerState::Idle,
            next_generation: 0,
        };
        let sysfs = SysfsPinAccessor::new(
            config.sysfs_root.clone(),
            Duration::from_millis(config.export_settle_ms),
        );

        Ok(Self {
            shared: Arc::new(Shared {
                platform,
                config,
                sysfs,
                state: Mutex::new(state),
                events,
            }),
        })
    }

    pub fn pin_count(&self) -> u32 {
        self.shared.config.pin_count
    }

    pub fn default_numbering(&self) -> NumberingScheme {
        NumberingScheme::Bcm
    }

    pub fn is_mode_supported(&self, mode: PinMode) -> bool {
        matches!(mode, PinMode::Input | PinMode::Output)
    }

    pub fn convert_pin_numbering(
        &self,
        pin: u32,
        from: NumberingScheme,
        to: NumberingScheme,
    ) -> Result<u32> {
        match (from, to) {
            (NumberingScheme::Bcm, NumberingScheme::Bcm) => Ok(pin),
            _ => Err(GpioError::Unsupported(format!(
                "pin numbering conversion {from:?} -> {to:?}"
            ))),
        }
    }

    pub fn open_pin(&self, pin: u32) -> Result<()> {
        self.check_range(pin)?;
        let shared = &self.shared;
        shared.sysfs.export(shared.platform.as_ref(), pin)?;

        let mut state = shared.state.lock();
        let record = state.table.get_mut(pin)?;
        if !record.exported {
            record.exported = true;
            if !record.debounce_set {
                record.debounce = shared.config.default_debounce(pin);
            }
        }
        Ok(())
    }

    /// Releases `pin` and unexports it. A pin this driver never opened is
    /// left exported for whoever owns it.
    pub fn close_pin(&self, pin: u32) -> Result<()> {
        self.check_range(pin)?;
        let shared = &self.shared;

        let disabled = self.disable_event_detection(pin);
        let opened = {
            let mut state = shared.state.lock();
            let opened = state.table.get(pin)?.exported;
            // reset even when disarming failed so the descriptor is never reused
            state.table.reset(pin)?;
            opened
        };
        shared.events.clear(pin);
        let unexported = if opened {
            shared.sysfs.unexport(shared.platform.as_ref(), pin)
        } else {
            Ok(())
        };

        disabled.and(unexported)
    }

    pub fn is_pin_open(&self, pin: u32) -> Result<bool> {
        Ok(self.shared.state.lock().table.get(pin)?.exported)
    }

    pub fn mode(&self, pin: u32) -> Result<PinMode> {
        self.check_open(pin)?;
        self.shared
            .sysfs
            .read_direction(self.shared.platform.as_ref(), pin)
    }

    pub fn set_mode(&self, pin: u32, mode: PinMode) -> Result<()> {
        self.check_open(pin)?;
        if !self.is_mode_supported(mode) {
            return Err(GpioError::Unsupported(format!(
                "pin mode {mode:?} on gpio{pin}"
            )));
        }
        self.shared
            .sysfs
            .write_direction(self.shared.platform.as_ref(), pin, mode)
    }

    pub fn read(&self, pin: u32) -> Result<PinValue> {
        self.check_open(pin)?;
        self.shared
            .sysfs
            .read_value(self.shared.platform.as_ref(), pin)
    }

    pub fn write(&self, pin: u32, value: PinValue) -> Result<()> {
        self.check_open(pin)?;
        self.shared
            .sysfs
            .write_value(self.shared.platform.as_ref(), pin, value)
    }

    /// Numeric variant of [`write`](Self::write); only 0 and 1 are accepted.
    pub fn write_raw(&self, pin: u32, value: u8) -> Result<()> {
        let value = PinValue::try_from(value)?;
        self.write(pin, value)
    }

    pub fn debounce(&self, pin: u32) -> Result<Duration> {
        Ok(self.shared.state.lock().table.get(pin)?.debounce)
    }

    pub fn set_debounce(&self, pin: u32, debounce: Duration) -> Result<()> {
        let mut state = self.shared.state.lock();
        let record = state.table.get_mut(pin)?;
        record.debounce = debounce;
        record.debounce_set = true;
        Ok(())
    }

    pub fn edge_kinds_to_detect(&self, pin: u32) -> Result<PinEventTypes> {
        self.check_open(pin)?;
        let edge = self
            .shared
            .sysfs
            .read_edge(self.shared.platform.as_ref(), pin)?;
        Ok(PinEventTypes::from(edge))
    }

    pub fn set_edge_kinds_to_detect(&self, pin: u32, kinds: PinEventTypes) -> Result<()> {
        self.check_open(pin)?;
        self.shared.sysfs.write_edge(
            self.shared.platform.as_ref(),
            pin,
            EdgeDetect::from(kinds),
        )
    }

    pub fn is_event_detection_enabled(&self, pin: u32) -> Result<bool> {
        Ok(self.shared.state.lock().table.get(pin)?.events_enabled)
    }

    pub fn set_event_detection_enabled(&self, pin: u32, enable: bool) -> Result<()> {
        if enable {
            self.check_open(pin)?;
            self.enable_event_detection(pin)
        } else {
            self.check_range(pin)?;
            self.disable_event_detection(pin)
        }
    }

    fn enable_event_detection(&self, pin: u32) -> Result<()> {
        let shared = &self.shared;
        let mut guard = shared.state.lock();
        let state = &mut *guard;
        if state.table.get(pin)?.events_enabled {
            return Ok(());
        }

        let pending = shared.poller().register(
            &mut state.table,
            &mut state.multiplexer,
            pin,
            &shared.sysfs.value_path(pin),
        )?;
        state.table.get_mut(pin)?.events_enabled = true;
        state.subscribed += 1;
        debug!("event detection enabled on gpio{pin} ({} subscribed)", state.subscribed);

        let idle = matches!(state.worker, WorkerState::Idle);
        if let (true, Some(mux)) = (idle, state.multiplexer) {
            let generation = state.next_generation;
            state.next_generation += 1;
            match events::spawn_worker(Arc::clone(shared), mux, generation) {
                Ok(handle) => state.worker = WorkerState::Running { generation, handle },
                Err(e) => {
                    // roll back; with no subscription left the multiplexer goes too
                    state.table.get_mut(pin)?.events_enabled = false;
                    state.subscribed -= 1;
                    let last = state.subscribed == 0;
                    let poller = shared.poller();
                    let detached = poller
                        .deregister(&mut state.table, &mut state.multiplexer, pin, true, last)
                        .ok()
                        .flatten()
                        .or_else(|| if last { state.multiplexer.take() } else { None });
                    if let Some(mux) = detached {
                        let _ = poller.destroy(mux);
                    }
                    return Err(e);
                }
            }
        }
        drop(guard);

        for other in pending {
            shared.handle_edge(other);
        }
        Ok(())
    }

    fn disable_event_detection(&self, pin: u32) -> Result<()> {
        let shared = &self.shared;
        let mut guard = shared.state.lock();
        let state = &mut *guard;
        if !state.table.get(pin)?.events_enabled {
            return Ok(());
        }

        state.table.get_mut(pin)?.events_enabled = false;
        state.subscribed -= 1;
        let last = state.subscribed == 0;
        debug!("event detection disabled on gpio{pin} ({} subscribed)", state.subscribed);

        let deregistered =
            shared
                .poller()
                .deregister(&mut state.table, &mut state.multiplexer, pin, true, last);
        // a failed deregistration leaves the multiplexer attached, but it is
        // unused once the last pin is gone
        let detached = match &deregistered {
            Ok(detached) => *detached,
            Err(_) if last => state.multiplexer.take(),
            Err(_) => None,
        };
        let worker = if last {
            mem::replace(&mut state.worker, WorkerState::Idle)
        } else {
            WorkerState::Idle
        };
        drop(guard);

        let retired = self.retire(detached, worker);
        deregistered.and(retired)
    }

    /// Stops a detached worker and closes the multiplexer it waited on.
    fn retire(&self, mux: Option<Multiplexer>, worker: WorkerState) -> Result<()> {
        let poller = self.shared.poller();
        if let Some(mux) = &mux {
            if let Err(e) = poller.wake(mux) {
                warn!("failed to wake event detection worker: {e}");
            }
        }
        if let WorkerState::Running { generation, handle } = worker {
            if handle.thread().id() == thread::current().id() {
                warn!("event detection worker {generation} retired from its own thread");
            } else if handle.join().is_err() {
                warn!("event detection worker {generation} panicked");
            } else {
                debug!("event detection worker {generation} stopped");
            }
        }
        match mux {
            Some(mux) => poller.destroy(mux),
            None => Ok(()),
        }
    }

    /// Blocks until an edge on `pin` passes the debounce filter or `timeout`
    /// elapses, using a private multiplexer.
    ///
    /// `Some(Duration::ZERO)` polls once and `None` waits without bound.
    pub fn wait_for_event(&self, pin: u32, timeout: Option<Duration>) -> Result<Option<PinEvent>> {
        self.check_open(pin)?;
        let shared = &self.shared;
        let platform = shared.platform.as_ref();
        let poller = shared.poller();

        let mux = poller.create()?;
        let fd = match platform.open_nonblocking_read(&shared.sysfs.value_path(pin)) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = poller.destroy(mux);
                return Err(e);
            }
        };

        let outcome = self.wait_on_private(&poller, &mux, pin, fd, timeout_ms(timeout));

        let teardown = poller
            .disarm(&mux, fd)
            .and(platform.close(fd))
            .and(poller.destroy(mux));
        let event = outcome?;
        teardown?;
        Ok(event)
    }

    fn wait_on_private(
        &self,
        poller: &EdgePoller<'_, P>,
        mux: &Multiplexer,
        pin: u32,
        fd: RawFd,
        timeout_ms: i32,
    ) -> Result<Option<PinEvent>> {
        poller.arm(mux, pin, fd)?;
        match poller.wait(mux, timeout_ms)? {
            Readiness::Pin(fired) if fired == pin => {
                let value = poller.consume(fd)?;
                let mut state = self.shared.state.lock();
                let record = state.table.get_mut(pin)?;
                if debounce_accepts(record.debounce, &mut record.last_wait_event, Instant::now()) {
                    Ok(Some(PinEvent::new(pin, value)))
                } else {
                    trace!("debounced edge on gpio{pin}");
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PinEvent> {
        self.shared.events.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<PinEvent> {
        BroadcastStream::new(self.subscribe())
    }

    pub fn events(&self, pin: u32, limit: Option<usize>) -> Result<Vec<PinEvent>> {
        self.check_range(pin)?;
        Ok(self.shared.events.history(pin, limit))
    }

    pub fn last_event(&self, pin: u32) -> Result<Option<PinEvent>> {
        self.check_range(pin)?;
        Ok(self.shared.events.last(pin))
    }

    /// Snapshot of the driver's bookkeeping for `pin`.
    pub fn pin_record(&self, pin: u32) -> Result<PinRecord> {
        Ok(self.shared.state.lock().table.get(pin)?.clone())
    }

    pub fn subscribed_pin_count(&self) -> usize {
        self.shared.state.lock().subscribed
    }

    pub fn is_worker_running(&self) -> bool {
        matches!(self.shared.state.lock().worker, WorkerState::Running { .. })
    }

    pub fn has_multiplexer(&self) -> bool {
        self.shared.state.lock().multiplexer.is_some()
    }

    /// Disables every subscription, closes every descriptor and unexports every
    /// pin this driver exported. Safe to call more than once.
    pub fn shutdown(&self) -> Result<()> {
        let pins = self.shared.state.lock().table.pins_in_use();
        let mut first_err = None;
        for pin in pins {
            if let Err(e) = self.close_pin(pin) {
                warn!("failed to release gpio{pin}: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn check_range(&self, pin: u32) -> Result<()> {
        self.shared.state.lock().table.check_range(pin)
    }

    fn check_open(&self, pin: u32) -> Result<()> {
        if self.shared.state.lock().table.get(pin)?.exported {
            Ok(())
        } else {
            Err(GpioError::PinNotOpen(pin))
        }
    }
}

impl<P: GpioPlatform + 'static> Drop for GpioDriver<P> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("gpio driver teardown incomplete: {e}");
        }
    }
}

fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX).max(1),
    }
}
