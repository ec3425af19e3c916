use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::{DEFAULT_SYSFS_ROOT, EdgeDetect, PinValue};
use crate::error::{GpioError, Result};
use crate::gpio::{GpioPlatform, WakerFds};
use crate::sysfs::{parse_edge, parse_value};

const EPERM: i32 = 1;
const ENOENT: i32 = 2;
const EBADF: i32 = 9;
const EACCES: i32 = 13;
const EBUSY: i32 = 16;
const EEXIST: i32 = 17;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const ESPIPE: i32 = 29;

fn os_err(op: &'static str, code: i32) -> GpioError {
    GpioError::io(op, io::Error::from_raw_os_error(code))
}

/// In-memory stand-in for the sysfs GPIO class and epoll.
///
/// Exported pins get `direction`, `value` and `edge` attributes; level changes
/// that match a pin's `edge` make every multiplexer watching one of its
/// `value` descriptors ready, once per change.
pub struct MockPlatform {
    root: PathBuf,
    state: Mutex<MockState>,
    changed: Condvar,
}

#[derive(Default)]
struct MockState {
    pins: BTreeMap<u32, MockPin>,
    fds: HashMap<RawFd, MockFd>,
    next_fd: RawFd,
    export_writes: usize,
    unexport_writes: usize,
    denied: HashSet<PathBuf>,
    wait_failure: Option<i32>,
}

struct MockPin {
    direction: String,
    value: String,
    edge: String,
}

impl Default for MockPin {
    fn default() -> Self {
        Self {
            direction: "in".into(),
            value: "0".into(),
            edge: "none".into(),
        }
    }
}

enum MockFd {
    Value { pin: u32 },
    Epoll(MockEpoll),
    PipeRead,
    PipeWrite { read: RawFd },
}

#[derive(Default)]
struct MockEpoll {
    interest: Vec<(RawFd, u64)>,
    ready: VecDeque<(RawFd, u64)>,
}

impl MockEpoll {
    fn make_ready(&mut self, fd: RawFd) {
        if let Some(&(_, token)) = self.interest.iter().find(|(f, _)| *f == fd) {
            if !self.ready.iter().any(|(f, _)| *f == fd) {
                self.ready.push_back((fd, token));
            }
        }
    }

    fn forget(&mut self, fd: RawFd) {
        self.interest.retain(|(f, _)| *f != fd);
        self.ready.retain(|(f, _)| *f != fd);
    }
}

enum Node {
    Root,
    Export,
    Unexport,
    PinDir(u32),
    Attr(u32, Attr),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Attr {
    Direction,
    Value,
    Edge,
}

impl MockState {
    fn allocate(&mut self, fd: MockFd) -> RawFd {
        let id = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(id, fd);
        id
    }

    fn epoll_mut(&mut self, fd: RawFd) -> Result<&mut MockEpoll> {
        match self.fds.get_mut(&fd) {
            Some(MockFd::Epoll(epoll)) => Ok(epoll),
            Some(_) => Err(os_err("epoll", EINVAL)),
            None => Err(os_err("epoll", EBADF)),
        }
    }

    fn make_ready(&mut self, sources: &[RawFd]) {
        for fd in self.fds.values_mut() {
            if let MockFd::Epoll(epoll) = fd {
                for source in sources {
                    epoll.make_ready(*source);
                }
            }
        }
    }

    fn value_fds(&self, pin: u32) -> Vec<RawFd> {
        self.fds
            .iter()
            .filter(|(_, fd)| matches!(fd, MockFd::Value { pin: p } if *p == pin))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Applies a level change and notifies watchers if the pin's edge matches.
    fn drive(&mut self, pin: u32, value: PinValue) -> bool {
        let Some(line) = self.pins.get_mut(&pin) else {
            return false;
        };
        let new = if value == PinValue::High { "1" } else { "0" };
        let rising = match parse_value(&line.value) {
            Ok(old) if old == value => return false,
            Ok(_) | Err(_) => value == PinValue::High,
        };
        line.value = new.into();

        let fires = match parse_edge(&line.edge) {
            Ok(EdgeDetect::Rising) => rising,
            Ok(EdgeDetect::Falling) => !rising,
            Ok(EdgeDetect::Both) => true,
            _ => false,
        };
        if fires {
            let sources = self.value_fds(pin);
            self.make_ready(&sources);
        }
        true
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl MockPlatform {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(MockState {
                next_fd: 100,
                ..MockState::default()
            }),
            changed: Condvar::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node(&self, path: &Path) -> Option<Node> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel.iter().filter_map(|c| c.to_str()).collect();
        let pin_of = |dir: &str| dir.strip_prefix("gpio")?.parse::<u32>().ok();
        match parts.as_slice() {
            [] => Some(Node::Root),
            ["export"] => Some(Node::Export),
            ["unexport"] => Some(Node::Unexport),
            [dir] => pin_of(*dir).map(Node::PinDir),
            [dir, attr] => {
                let pin = pin_of(*dir)?;
                let attr = match *attr {
                    "direction" => Attr::Direction,
                    "value" => Attr::Value,
                    "edge" => Attr::Edge,
                    _ => return None,
                };
                Some(Node::Attr(pin, attr))
            }
            _ => None,
        }
    }

    /// Drives an input line from outside, as attached hardware would.
    pub fn set_line(&self, pin: u32, value: PinValue) -> bool {
        let changed = self.state.lock().drive(pin, value);
        self.changed.notify_all();
        changed
    }

    /// Reports readiness on every `value` descriptor of `pin` without a level
    /// change, like contact bounce the kernel latched.
    pub fn trigger_edge(&self, pin: u32) {
        let mut state = self.state.lock();
        let sources = state.value_fds(pin);
        state.make_ready(&sources);
        drop(state);
        self.changed.notify_all();
    }

    /// Overwrites an attribute without validation.
    pub fn corrupt_attribute(&self, pin: u32, attr: &str, contents: &str) {
        let mut state = self.state.lock();
        if let Some(p) = state.pins.get_mut(&pin) {
            match attr {
                "direction" => p.direction = contents.into(),
                "value" => p.value = contents.into(),
                "edge" => p.edge = contents.into(),
                _ => {}
            }
        }
    }

    /// Makes writes to `path` fail with `EACCES`.
    pub fn deny_writes(&self, path: impl Into<PathBuf>) {
        self.state.lock().denied.insert(path.into());
    }

    /// Makes every multiplexer wait fail with `code` until cleared with `None`.
    pub fn fail_waits(&self, code: Option<i32>) {
        self.state.lock().wait_failure = code;
        self.changed.notify_all();
    }

    /// Exports `pin` behind the driver's back, as another process would.
    pub fn preexport(&self, pin: u32) {
        self.state.lock().pins.entry(pin).or_default();
    }

    pub fn is_exported(&self, pin: u32) -> bool {
        self.state.lock().pins.contains_key(&pin)
    }

    pub fn export_writes(&self) -> usize {
        self.state.lock().export_writes
    }

    pub fn unexport_writes(&self) -> usize {
        self.state.lock().unexport_writes
    }

    pub fn open_fd_count(&self) -> usize {
        self.state.lock().fds.len()
    }

    pub fn open_value_fd_count(&self) -> usize {
        self.state
            .lock()
            .fds
            .values()
            .filter(|fd| matches!(fd, MockFd::Value { .. }))
            .count()
    }
}

impl GpioPlatform for MockPlatform {
    fn path_exists(&self, path: &Path) -> bool {
        let state = self.state.lock();
        match self.node(path) {
            Some(Node::Root | Node::Export | Node::Unexport) => true,
            Some(Node::PinDir(pin) | Node::Attr(pin, _)) => state.pins.contains_key(&pin),
            None => false,
        }
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        let state = self.state.lock();
        let Some(Node::Attr(pin, attr)) = self.node(path) else {
            return Err(os_err("read sysfs attribute", ENOENT));
        };
        let pin = state
            .pins
            .get(&pin)
            .ok_or_else(|| os_err("read sysfs attribute", ENOENT))?;
        let contents = match attr {
            Attr::Direction => &pin.direction,
            Attr::Value => &pin.value,
            Attr::Edge => &pin.edge,
        };
        Ok(format!("{contents}\n"))
    }

    fn write_str(&self, path: &Path, contents: &str) -> Result<()> {
        const OP: &str = "write sysfs attribute";
        let mut state = self.state.lock();
        if state.denied.contains(path) {
            return Err(os_err(OP, EACCES));
        }
        let node = self.node(path).ok_or_else(|| os_err(OP, ENOENT))?;
        match node {
            Node::Export => {
                let pin = contents.trim().parse().map_err(|_| os_err(OP, EINVAL))?;
                if state.pins.contains_key(&pin) {
                    return Err(os_err(OP, EBUSY));
                }
                state.pins.insert(pin, MockPin::default());
                state.export_writes += 1;
            }
            Node::Unexport => {
                let pin = contents.trim().parse().map_err(|_| os_err(OP, EINVAL))?;
                state.pins.remove(&pin).ok_or_else(|| os_err(OP, EINVAL))?;
                state.unexport_writes += 1;
            }
            Node::Attr(pin, attr) => {
                let current = state
                    .pins
                    .get_mut(&pin)
                    .ok_or_else(|| os_err(OP, ENOENT))?;
                let token = contents.trim();
                match attr {
                    Attr::Direction => match token {
                        "in" | "out" => current.direction = token.into(),
                        "high" | "low" => {
                            current.direction = "out".into();
                            current.value = if token == "high" { "1" } else { "0" }.into();
                        }
                        _ => return Err(os_err(OP, EINVAL)),
                    },
                    Attr::Edge => {
                        parse_edge(token).map_err(|_| os_err(OP, EINVAL))?;
                        current.edge = token.into();
                    }
                    Attr::Value => {
                        if current.direction != "out" {
                            return Err(os_err(OP, EPERM));
                        }
                        let value = parse_value(token).map_err(|_| os_err(OP, EINVAL))?;
                        state.drive(pin, value);
                        drop(state);
                        self.changed.notify_all();
                    }
                }
            }
            Node::Root | Node::PinDir(_) => return Err(os_err(OP, EINVAL)),
        }
        Ok(())
    }

    fn open_nonblocking_read(&self, path: &Path) -> Result<RawFd> {
        let mut state = self.state.lock();
        match self.node(path) {
            Some(Node::Attr(pin, Attr::Value)) if state.pins.contains_key(&pin) => {
                Ok(state.allocate(MockFd::Value { pin }))
            }
            _ => Err(os_err("open value file", ENOENT)),
        }
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        let mut state = self.state.lock();
        state.fds.remove(&fd).ok_or_else(|| os_err("close", EBADF))?;
        for entry in state.fds.values_mut() {
            if let MockFd::Epoll(epoll) = entry {
                epoll.forget(fd);
            }
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn seek_to_start(&self, fd: RawFd) -> Result<()> {
        match self.state.lock().fds.get(&fd) {
            Some(MockFd::Value { .. }) => Ok(()),
            Some(_) => Err(os_err("seek value file", ESPIPE)),
            None => Err(os_err("seek value file", EBADF)),
        }
    }

    fn read_byte(&self, fd: RawFd) -> Result<u8> {
        let state = self.state.lock();
        match state.fds.get(&fd) {
            Some(MockFd::Value { pin }) => {
                let pin = state
                    .pins
                    .get(pin)
                    .ok_or_else(|| os_err("read value file", ENODEV))?;
                pin.value
                    .bytes()
                    .next()
                    .ok_or_else(|| {
                        GpioError::io(
                            "read value file",
                            io::Error::new(io::ErrorKind::UnexpectedEof, "short read of 0 bytes"),
                        )
                    })
            }
            Some(_) => Err(os_err("read value file", EINVAL)),
            None => Err(os_err("read value file", EBADF)),
        }
    }

    fn create_multiplexer(&self) -> Result<RawFd> {
        Ok(self
            .state
            .lock()
            .allocate(MockFd::Epoll(MockEpoll::default())))
    }

    fn register_edge(&self, mux: RawFd, fd: RawFd, token: u64) -> Result<()> {
        let mut state = self.state.lock();
        let is_value = match state.fds.get(&fd) {
            Some(MockFd::Value { .. }) => true,
            Some(_) => false,
            None => return Err(os_err("epoll_ctl add", EBADF)),
        };
        let epoll = state.epoll_mut(mux)?;
        if epoll.interest.iter().any(|(f, _)| *f == fd) {
            return Err(os_err("epoll_ctl add", EEXIST));
        }
        epoll.interest.push((fd, token));
        // sysfs reports the current level right away
        if is_value {
            epoll.make_ready(fd);
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn deregister(&self, mux: RawFd, fd: RawFd) -> Result<()> {
        let mut state = self.state.lock();
        let epoll = state.epoll_mut(mux)?;
        if !epoll.interest.iter().any(|(f, _)| *f == fd) {
            return Err(os_err("epoll_ctl del", ENOENT));
        }
        epoll.forget(fd);
        Ok(())
    }

    fn wait_ready(&self, mux: RawFd, timeout_ms: i32) -> Result<Option<u64>> {
        let deadline = (timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        let mut state = self.state.lock();
        loop {
            if let Some(code) = state.wait_failure {
                return Err(os_err("epoll_wait", code));
            }
            if let Some((_, token)) = state.epoll_mut(mux)?.ready.pop_front() {
                return Ok(Some(token));
            }
            match (timeout_ms, deadline) {
                (0, _) => return Ok(None),
                (_, Some(deadline)) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        let ready = state.epoll_mut(mux)?.ready.pop_front();
                        return Ok(ready.map(|(_, token)| token));
                    }
                }
                (_, None) => self.changed.wait(&mut state),
            }
        }
    }

    fn create_waker(&self) -> Result<WakerFds> {
        let mut state = self.state.lock();
        let read = state.allocate(MockFd::PipeRead);
        let write = state.allocate(MockFd::PipeWrite { read });
        Ok(WakerFds { read, write })
    }

    fn wake(&self, waker: &WakerFds) -> Result<()> {
        let mut state = self.state.lock();
        let read = match state.fds.get(&waker.write) {
            Some(MockFd::PipeWrite { read }) => *read,
            Some(_) => return Err(os_err("wake multiplexer", EINVAL)),
            None => return Err(os_err("wake multiplexer", EBADF)),
        };
        state.make_ready(&[read]);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }
}
