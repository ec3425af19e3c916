#[cfg(feature = "linux-sysfs")]
pub mod linux;
pub mod mock;

#[cfg(feature = "linux-sysfs")]
pub use linux::LinuxPlatform;
pub use mock::MockPlatform;
