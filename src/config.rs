use std::{fs, path::Path, path::PathBuf, time::Duration};

use bitflags::bitflags;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PinMode {
    Input,
    Output,
    InputPullUp,
    InputPullDown,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PinValue {
    Low,
    High,
}

impl TryFrom<u8> for PinValue {
    type Error = GpioError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PinValue::Low),
            1 => Ok(PinValue::High),
            _ => Err(GpioError::InvalidValue(format!(
                "value must be 0 or 1, got {value}"
            ))),
        }
    }
}

impl From<PinValue> for u8 {
    fn from(value: PinValue) -> Self {
        match value {
            PinValue::Low => 0,
            PinValue::High => 1,
        }
    }
}

/// Edge selection as the sysfs `edge` attribute can express it.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDetect {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

bitflags! {
    /// Edge vocabulary of the pin-abstraction layer sitting above this driver.
    ///
    /// sysfs cannot tell a synchronous request from an asynchronous one, so
    /// anything read back from the kernel carries both variants of a direction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PinEventTypes: u8 {
        const RISING_SYNC = 1 << 0;
        const RISING_ASYNC = 1 << 1;
        const FALLING_SYNC = 1 << 2;
        const FALLING_ASYNC = 1 << 3;
        const RISING = Self::RISING_SYNC.bits() | Self::RISING_ASYNC.bits();
        const FALLING = Self::FALLING_SYNC.bits() | Self::FALLING_ASYNC.bits();
        const BOTH = Self::RISING.bits() | Self::FALLING.bits();
    }
}

impl From<PinEventTypes> for EdgeDetect {
    fn from(kinds: PinEventTypes) -> Self {
        match (
            kinds.intersects(PinEventTypes::RISING),
            kinds.intersects(PinEventTypes::FALLING),
        ) {
            (false, false) => EdgeDetect::None,
            (true, false) => EdgeDetect::Rising,
            (false, true) => EdgeDetect::Falling,
            (true, true) => EdgeDetect::Both,
        }
    }
}

impl From<EdgeDetect> for PinEventTypes {
    fn from(edge: EdgeDetect) -> Self {
        match edge {
            EdgeDetect::None => PinEventTypes::empty(),
            EdgeDetect::Rising => PinEventTypes::RISING,
            EdgeDetect::Falling => PinEventTypes::FALLING,
            EdgeDetect::Both => PinEventTypes::BOTH,
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NumberingScheme {
    Bcm,
    Board,
    Logical,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DriverConfig {
    pub pin_count: u32,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
    /// How long `export` waits for the kernel to create `gpio<N>/`.
    #[serde(default)]
    pub export_settle_ms: u64,
    #[serde(default)]
    pub default_debounce_ms: FxHashMap<u32, u64>,
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from(DEFAULT_SYSFS_ROOT)
}

fn default_event_channel_capacity() -> usize {
    64
}

fn default_event_history_capacity() -> usize {
    32
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            pin_count: 28,
            sysfs_root: default_sysfs_root(),
            event_channel_capacity: default_event_channel_capacity(),
            event_history_capacity: default_event_history_capacity(),
            export_settle_ms: 0,
            default_debounce_ms: FxHashMap::default(),
        }
    }
}

impl DriverConfig {
    pub fn with_pin_count(pin_count: u32) -> Self {
        Self {
            pin_count,
            ..Self::default()
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GpioError> {
        if self.event_channel_capacity == 0 {
            return Err(GpioError::Config(
                "event_channel_capacity must be greater than zero".into(),
            ));
        }
        if let Some(pin) = self
            .default_debounce_ms
            .keys()
            .find(|pin| **pin >= self.pin_count)
        {
            return Err(GpioError::Config(format!(
                "default_debounce_ms names pin {pin} outside pin count {}",
                self.pin_count
            )));
        }
        Ok(())
    }

    pub(crate) fn default_debounce(&self, pin: u32) -> Duration {
        self.default_debounce_ms
            .get(&pin)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or_default()
    }
}
