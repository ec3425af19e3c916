//! GPIO access through the Linux sysfs GPIO class, with edge detection built
//! on `epoll`.
//!
//! [`GpioDriver`] exports pins, configures direction and edge selection, reads
//! and writes levels, and reports debounced edges either through
//! [`GpioDriver::wait_for_event`] or as a broadcast stream fed by a background
//! worker that runs while at least one pin is subscribed.

pub mod backend;
mod config;
mod error;
mod events;
mod gpio;
mod poller;
mod sysfs;
mod table;

pub use config::{
    DEFAULT_SYSFS_ROOT, DriverConfig, EdgeDetect, NumberingScheme, PinEventTypes, PinMode,
    PinValue,
};
pub use error::{GpioError, Result};
pub use events::{PinEvent, debounce_accepts};
pub use gpio::{GpioDriver, GpioPlatform, WakerFds};
pub use poller::{EdgePoller, Multiplexer, Readiness, WAKE_TOKEN};
pub use sysfs::SysfsPinAccessor;
pub use table::{PinRecord, PinTable};

#[cfg(feature = "linux-sysfs")]
pub use backend::LinuxPlatform;
pub use backend::MockPlatform;
