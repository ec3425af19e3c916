use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::sys::epoll::{
    EpollCreateFlags, EpollEvent, EpollFlags, EpollOp, epoll_create1, epoll_ctl, epoll_wait,
};
use nix::sys::stat::Mode;
use nix::unistd::{Whence, close, lseek, pipe2, read, write};

use crate::error::{GpioError, Result};
use crate::gpio::{GpioPlatform, WakerFds};

fn sys_err(op: &'static str) -> impl FnOnce(Errno) -> GpioError {
    move |errno| GpioError::io(op, io::Error::from_raw_os_error(errno as i32))
}

/// Kernel-backed platform: sysfs through `std::fs`, descriptors and epoll
/// through `nix`.
#[derive(Debug, Default)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl GpioPlatform for LinuxPlatform {
    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| GpioError::io("read sysfs attribute", e))
    }

    fn write_str(&self, path: &Path, contents: &str) -> Result<()> {
        // sysfs attributes exist already; never create or truncate them
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| GpioError::io("open sysfs attribute", e))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| GpioError::io("write sysfs attribute", e))
    }

    fn open_nonblocking_read(&self, path: &Path) -> Result<RawFd> {
        open(
            path,
            OFlag::O_RDONLY | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(sys_err("open value file"))
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        close(fd).map_err(sys_err("close"))
    }

    fn seek_to_start(&self, fd: RawFd) -> Result<()> {
        lseek(fd, 0, Whence::SeekSet)
            .map(|_| ())
            .map_err(sys_err("seek value file"))
    }

    fn read_byte(&self, fd: RawFd) -> Result<u8> {
        let mut buf = [0u8; 1];
        match read(fd, &mut buf).map_err(sys_err("read value file"))? {
            1 => Ok(buf[0]),
            n => Err(GpioError::io(
                "read value file",
                io::Error::new(io::ErrorKind::UnexpectedEof, format!("short read of {n} bytes")),
            )),
        }
    }

    fn create_multiplexer(&self) -> Result<RawFd> {
        epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).map_err(sys_err("epoll_create1"))
    }

    fn register_edge(&self, mux: RawFd, fd: RawFd, token: u64) -> Result<()> {
        let mut event = EpollEvent::new(
            EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI | EpollFlags::EPOLLET,
            token,
        );
        epoll_ctl(mux, EpollOp::EpollCtlAdd, fd, &mut event).map_err(sys_err("epoll_ctl add"))
    }

    fn deregister(&self, mux: RawFd, fd: RawFd) -> Result<()> {
        let mut event = EpollEvent::empty();
        epoll_ctl(mux, EpollOp::EpollCtlDel, fd, &mut event).map_err(sys_err("epoll_ctl del"))
    }

    fn wait_ready(&self, mux: RawFd, timeout_ms: i32) -> Result<Option<u64>> {
        let mut events = [EpollEvent::empty()];
        let ready = epoll_wait(mux, &mut events, timeout_ms as isize)
            .map_err(sys_err("epoll_wait"))?;
        Ok((ready > 0).then(|| events[0].data()))
    }

    fn create_waker(&self) -> Result<WakerFds> {
        let (read, write) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(sys_err("pipe2"))?;
        Ok(WakerFds { read, write })
    }

    fn wake(&self, waker: &WakerFds) -> Result<()> {
        match write(waker.write, &[1u8]) {
            // a full pipe already wakes every waiter
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(errno) => Err(sys_err("wake multiplexer")(errno)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::{EdgePoller, Readiness};
    use std::path::PathBuf;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sysfs-gpio-epoll-{name}-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn attribute_writes_do_not_create_files() {
        let dir = scratch_dir("attrs");
        let platform = LinuxPlatform::new();
        let attr = dir.join("direction");

        assert!(matches!(
            platform.write_str(&attr, "out"),
            Err(GpioError::Io { .. })
        ));
        fs::write(&attr, "in").unwrap();
        platform.write_str(&attr, "out").unwrap();
        assert_eq!(platform.read_to_string(&attr).unwrap(), "out");

        let fd = platform.open_nonblocking_read(&attr).unwrap();
        platform.seek_to_start(fd).unwrap();
        assert_eq!(platform.read_byte(fd).unwrap(), b'o');
        platform.close(fd).unwrap();
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn waker_interrupts_epoll_wait() {
        let platform = LinuxPlatform::new();
        let poller = EdgePoller::new(&platform);
        let mux = poller.create().unwrap();

        assert_eq!(poller.wait(&mux, 0).unwrap(), Readiness::Timeout);
        poller.wake(&mux).unwrap();
        assert_eq!(poller.wait(&mux, 1000).unwrap(), Readiness::Woken);
        // edge triggered: the same wake is reported only once
        assert_eq!(poller.wait(&mux, 0).unwrap(), Readiness::Timeout);
        poller.destroy(mux).unwrap();
    }

    #[test]
    fn registered_descriptor_reports_its_token() {
        let platform = LinuxPlatform::new();
        let poller = EdgePoller::new(&platform);
        let mux = poller.create().unwrap();
        let source = platform.create_waker().unwrap();

        platform.register_edge(mux.epoll_fd, source.read, 7).unwrap();
        platform.wake(&source).unwrap();
        assert_eq!(poller.wait(&mux, 1000).unwrap(), Readiness::Pin(7));

        poller.disarm(&mux, source.read).unwrap();
        platform.close(source.read).unwrap();
        platform.close(source.write).unwrap();
        poller.destroy(mux).unwrap();
    }
}
