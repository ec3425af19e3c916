use std::os::unix::io::RawFd;
use std::path::Path;

use log::{trace, warn};

use crate::config::PinValue;
use crate::error::{GpioError, Result};
use crate::gpio::{GpioPlatform, WakerFds};
use crate::sysfs::parse_value_byte;
use crate::table::PinTable;

/// Registration tag reserved for the waker; pin tags never exceed `u32::MAX`.
pub const WAKE_TOKEN: u64 = u64::MAX;

/// Upper bound on zero-timeout polls while arming a pin.
const ARM_POLL_LIMIT: usize = 64;

/// An epoll instance together with the pipe used to interrupt its waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Multiplexer {
    pub epoll_fd: RawFd,
    pub waker: WakerFds,
}

/// Result of [`EdgePoller::arm`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Armed {
    /// The armed pin's initial readiness was consumed. If not, a concurrent
    /// waiter on the same multiplexer picked it up instead.
    pub swallowed: bool,
    /// Pins whose edges were popped while arming and still need handling.
    pub pending: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Timeout,
    Woken,
    Pin(u32),
}

/// Arms sysfs `value` files for edge notification and consumes the edges.
pub struct EdgePoller<'a, P: GpioPlatform> {
    platform: &'a P,
}

impl<'a, P: GpioPlatform> EdgePoller<'a, P> {
    pub fn new(platform: &'a P) -> Self {
        Self { platform }
    }

    pub fn create(&self) -> Result<Multiplexer> {
        let epoll_fd = self.platform.create_multiplexer()?;
        let waker = match self.platform.create_waker() {
            Ok(waker) => waker,
            Err(e) => {
                let _ = self.platform.close(epoll_fd);
                return Err(e);
            }
        };
        let mux = Multiplexer { epoll_fd, waker };
        if let Err(e) = self.platform.register_edge(epoll_fd, waker.read, WAKE_TOKEN) {
            let _ = self.destroy(mux);
            return Err(e);
        }
        Ok(mux)
    }

    /// Closes the epoll instance and its waker. Attempts every close and
    /// reports the first failure.
    pub fn destroy(&self, mux: Multiplexer) -> Result<()> {
        let results = [
            self.platform.close(mux.epoll_fd),
            self.platform.close(mux.waker.read),
            self.platform.close(mux.waker.write),
        ];
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    pub fn wake(&self, mux: &Multiplexer) -> Result<()> {
        self.platform.wake(&mux.waker)
    }

    /// Adds `value_fd` to `mux` tagged with `pin` and swallows the readiness
    /// sysfs reports for the current level.
    ///
    /// Readiness of other pins popped on the way is handed back in
    /// [`Armed::pending`]; an edge-triggered multiplexer never reports it again.
    pub fn arm(&self, mux: &Multiplexer, pin: u32, value_fd: RawFd) -> Result<Armed> {
        self.platform
            .register_edge(mux.epoll_fd, value_fd, u64::from(pin))?;
        let mut armed = Armed::default();
        for _ in 0..ARM_POLL_LIMIT {
            match self.wait(mux, 0)? {
                Readiness::Pin(fired) if fired == pin => {
                    self.consume(value_fd)?;
                    armed.swallowed = true;
                    break;
                }
                Readiness::Pin(other) => {
                    trace!("gpio{other} became ready while arming gpio{pin}");
                    armed.pending.push(other);
                }
                Readiness::Woken => trace!("stale wake while arming gpio{pin}"),
                Readiness::Timeout => break,
            }
        }
        Ok(armed)
    }

    pub fn disarm(&self, mux: &Multiplexer, value_fd: RawFd) -> Result<()> {
        self.platform.deregister(mux.epoll_fd, value_fd)
    }

    /// Lazily creates the shared multiplexer, opens the pin's `value` file and
    /// arms it. Returns the other pins found ready while arming.
    pub fn register(
        &self,
        table: &mut PinTable,
        shared: &mut Option<Multiplexer>,
        pin: u32,
        value_path: &Path,
    ) -> Result<Vec<u32>> {
        let created = shared.is_none();
        let mux = match *shared {
            Some(mux) => mux,
            None => {
                let mux = self.create()?;
                *shared = Some(mux);
                mux
            }
        };

        let record = table.get_mut(pin)?;
        let opened = record.value_fd.is_none();
        let opened_fd = match record.value_fd {
            Some(fd) => Ok(fd),
            None => self.platform.open_nonblocking_read(value_path),
        };
        let fd = match opened_fd {
            Ok(fd) => fd,
            Err(e) => {
                if created {
                    *shared = None;
                    let _ = self.destroy(mux);
                }
                return Err(e);
            }
        };

        match self.arm(&mux, pin, fd) {
            Ok(armed) => {
                record.value_fd = Some(fd);
                record.swallow_initial = !armed.swallowed;
                Ok(armed.pending)
            }
            Err(e) => {
                if opened {
                    let _ = self.platform.close(fd);
                }
                if created {
                    *shared = None;
                    let _ = self.destroy(mux);
                }
                Err(e)
            }
        }
    }

    /// Removes the pin from the shared multiplexer.
    ///
    /// With `close_multiplexer` the multiplexer is detached from `shared` and
    /// handed back; the caller closes it once nothing waits on it anymore. On
    /// failure `shared` is left attached.
    pub fn deregister(
        &self,
        table: &mut PinTable,
        shared: &mut Option<Multiplexer>,
        pin: u32,
        close_value_fd: bool,
        close_multiplexer: bool,
    ) -> Result<Option<Multiplexer>> {
        let record = table.get_mut(pin)?;
        let mut first_err = None;

        if let (Some(mux), Some(fd)) = (shared.as_ref(), record.value_fd) {
            if let Err(e) = self.disarm(mux, fd) {
                warn!("failed to disarm gpio{pin}: {e}");
                first_err.get_or_insert(e);
            }
        }
        if close_value_fd {
            if let Some(fd) = record.value_fd.take() {
                if let Err(e) = self.platform.close(fd) {
                    first_err.get_or_insert(e);
                }
            }
            record.swallow_initial = false;
        }

        match first_err {
            Some(e) => Err(e),
            None if close_multiplexer => Ok(shared.take()),
            None => Ok(None),
        }
    }

    /// Waits for a single readiness on `mux`. `timeout_ms` of zero polls,
    /// a negative value blocks without bound.
    pub fn wait(&self, mux: &Multiplexer, timeout_ms: i32) -> Result<Readiness> {
        match self.platform.wait_ready(mux.epoll_fd, timeout_ms)? {
            None => Ok(Readiness::Timeout),
            Some(WAKE_TOKEN) => Ok(Readiness::Woken),
            Some(token) => u32::try_from(token).map(Readiness::Pin).map_err(|_| {
                GpioError::InvalidValue(format!("unexpected multiplexer token {token}"))
            }),
        }
    }

    /// Rewinds the `value` file and reads the level that triggered the edge,
    /// which also clears the pending condition.
    pub fn consume(&self, value_fd: RawFd) -> Result<PinValue> {
        self.platform.seek_to_start(value_fd)?;
        parse_value_byte(self.platform.read_byte(value_fd)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockPlatform;
    use crate::sysfs::SysfsPinAccessor;
    use std::time::Duration;

    fn exported(pin: u32) -> (MockPlatform, SysfsPinAccessor) {
        let platform = MockPlatform::default();
        let sysfs = SysfsPinAccessor::new(platform.root(), Duration::ZERO);
        sysfs.export(&platform, pin).unwrap();
        sysfs
            .write_edge(&platform, pin, crate::config::EdgeDetect::Both)
            .unwrap();
        (platform, sysfs)
    }

    #[test]
    fn register_swallows_initial_readiness() {
        let (platform, sysfs) = exported(4);
        let poller = EdgePoller::new(&platform);
        let mut table = PinTable::new(8);
        let mut shared = None;

        poller
            .register(&mut table, &mut shared, 4, &sysfs.value_path(4))
            .unwrap();
        let mux = shared.expect("multiplexer created lazily");
        assert!(table.get(4).unwrap().value_fd.is_some());
        assert!(!table.get(4).unwrap().swallow_initial);
        assert_eq!(poller.wait(&mux, 0).unwrap(), Readiness::Timeout);
    }

    #[test]
    fn arming_hands_back_edges_of_other_pins() {
        let (platform, sysfs) = exported(0);
        sysfs.export(&platform, 1).unwrap();
        sysfs
            .write_edge(&platform, 1, crate::config::EdgeDetect::Both)
            .unwrap();
        let poller = EdgePoller::new(&platform);
        let mut table = PinTable::new(2);
        let mut shared = None;

        let pending = poller
            .register(&mut table, &mut shared, 0, &sysfs.value_path(0))
            .unwrap();
        assert!(pending.is_empty());
        platform.set_line(0, PinValue::High);

        let pending = poller
            .register(&mut table, &mut shared, 1, &sysfs.value_path(1))
            .unwrap();
        assert_eq!(pending, vec![0]);
        assert!(!table.get(1).unwrap().swallow_initial);

        let mux = shared.unwrap();
        assert_eq!(poller.wait(&mux, 0).unwrap(), Readiness::Timeout);
        let fd = table.get(0).unwrap().value_fd.unwrap();
        assert_eq!(poller.consume(fd).unwrap(), PinValue::High);
    }

    #[test]
    fn wait_reports_pin_and_consume_reads_new_level() {
        let (platform, sysfs) = exported(4);
        let poller = EdgePoller::new(&platform);
        let mut table = PinTable::new(8);
        let mut shared = None;
        poller
            .register(&mut table, &mut shared, 4, &sysfs.value_path(4))
            .unwrap();
        let mux = shared.unwrap();

        platform.set_line(4, PinValue::High);
        assert_eq!(poller.wait(&mux, 100).unwrap(), Readiness::Pin(4));
        let fd = table.get(4).unwrap().value_fd.unwrap();
        assert_eq!(poller.consume(fd).unwrap(), PinValue::High);
    }

    #[test]
    fn wake_interrupts_unbounded_wait() {
        let platform = MockPlatform::default();
        let poller = EdgePoller::new(&platform);
        let mux = poller.create().unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| EdgePoller::new(&platform).wait(&mux, -1));
            std::thread::sleep(Duration::from_millis(20));
            poller.wake(&mux).unwrap();
            assert_eq!(waiter.join().unwrap().unwrap(), Readiness::Woken);
        });
        poller.destroy(mux).unwrap();
        assert_eq!(platform.open_fd_count(), 0);
    }

    #[test]
    fn deregister_closes_what_it_is_told_to() {
        let (platform, sysfs) = exported(1);
        let poller = EdgePoller::new(&platform);
        let mut table = PinTable::new(2);
        let mut shared = None;
        poller
            .register(&mut table, &mut shared, 1, &sysfs.value_path(1))
            .unwrap();

        let detached = poller
            .deregister(&mut table, &mut shared, 1, true, false)
            .unwrap();
        assert!(detached.is_none());
        assert!(shared.is_some());
        assert!(table.get(1).unwrap().value_fd.is_none());

        let detached = poller
            .deregister(&mut table, &mut shared, 1, true, true)
            .unwrap()
            .expect("multiplexer handed back");
        assert!(shared.is_none());
        poller.destroy(detached).unwrap();
        assert_eq!(platform.open_fd_count(), 0);
    }
}
