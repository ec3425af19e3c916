use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::config::{EdgeDetect, PinMode, PinValue};
use crate::error::{GpioError, Result};
use crate::gpio::GpioPlatform;

const EXPORT_SETTLE_POLL: Duration = Duration::from_millis(5);

/// Text translation layer over the sysfs GPIO class.
#[derive(Debug, Clone)]
pub struct SysfsPinAccessor {
    root: PathBuf,
    export_settle: Duration,
}

impl SysfsPinAccessor {
    pub fn new(root: impl Into<PathBuf>, export_settle: Duration) -> Self {
        Self {
            root: root.into(),
            export_settle,
        }
    }

    pub fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    pub fn value_path(&self, pin: u32) -> PathBuf {
        self.pin_dir(pin).join("value")
    }

    fn direction_path(&self, pin: u32) -> PathBuf {
        self.pin_dir(pin).join("direction")
    }

    fn edge_path(&self, pin: u32) -> PathBuf {
        self.pin_dir(pin).join("edge")
    }

    pub fn export<P: GpioPlatform>(&self, platform: &P, pin: u32) -> Result<()> {
        if platform.path_exists(&self.pin_dir(pin)) {
            debug!("gpio{pin} already exported");
            return Ok(());
        }
        platform.write_str(&self.root.join("export"), &pin.to_string())?;
        debug!("exported gpio{pin}");

        if !self.export_settle.is_zero() {
            let deadline = Instant::now() + self.export_settle;
            while !platform.path_exists(&self.pin_dir(pin)) && Instant::now() < deadline {
                thread::sleep(EXPORT_SETTLE_POLL);
            }
        }
        Ok(())
    }

    pub fn unexport<P: GpioPlatform>(&self, platform: &P, pin: u32) -> Result<()> {
        if !platform.path_exists(&self.pin_dir(pin)) {
            return Ok(());
        }
        platform.write_str(&self.root.join("unexport"), &pin.to_string())?;
        debug!("unexported gpio{pin}");
        Ok(())
    }

    pub fn read_direction<P: GpioPlatform>(&self, platform: &P, pin: u32) -> Result<PinMode> {
        let raw = platform.read_to_string(&self.direction_path(pin))?;
        parse_direction(&raw)
    }

    pub fn write_direction<P: GpioPlatform>(
        &self,
        platform: &P,
        pin: u32,
        mode: PinMode,
    ) -> Result<()> {
        let token = match mode {
            PinMode::Input => "in",
            PinMode::Output => "out",
            other => {
                return Err(GpioError::Unsupported(format!(
                    "pin mode {other:?} cannot be set through sysfs"
                )));
            }
        };
        platform.write_str(&self.direction_path(pin), token)
    }

    pub fn read_value<P: GpioPlatform>(&self, platform: &P, pin: u32) -> Result<PinValue> {
        let raw = platform.read_to_string(&self.value_path(pin))?;
        parse_value(&raw)
    }

    pub fn write_value<P: GpioPlatform>(
        &self,
        platform: &P,
        pin: u32,
        value: PinValue,
    ) -> Result<()> {
        let token = match value {
            PinValue::Low => "0",
            PinValue::High => "1",
        };
        platform.write_str(&self.value_path(pin), token)
    }

    pub fn read_edge<P: GpioPlatform>(&self, platform: &P, pin: u32) -> Result<EdgeDetect> {
        let raw = platform.read_to_string(&self.edge_path(pin))?;
        parse_edge(&raw)
    }

    pub fn write_edge<P: GpioPlatform>(
        &self,
        platform: &P,
        pin: u32,
        edge: EdgeDetect,
    ) -> Result<()> {
        platform.write_str(&self.edge_path(pin), edge_token(edge))
    }
}

pub(crate) fn parse_direction(raw: &str) -> Result<PinMode> {
    match raw.trim() {
        "in" => Ok(PinMode::Input),
        "out" => Ok(PinMode::Output),
        other => Err(GpioError::Unsupported(format!(
            "unknown sysfs direction {other:?}"
        ))),
    }
}

pub(crate) fn parse_value(raw: &str) -> Result<PinValue> {
    match raw.trim() {
        "0" => Ok(PinValue::Low),
        "1" => Ok(PinValue::High),
        other => Err(GpioError::InvalidValue(format!(
            "unknown sysfs value {other:?}"
        ))),
    }
}

/// Interprets the single byte read from an armed `value` file.
pub(crate) fn parse_value_byte(byte: u8) -> Result<PinValue> {
    match byte {
        b'0' => Ok(PinValue::Low),
        b'1' => Ok(PinValue::High),
        other => Err(GpioError::InvalidValue(format!(
            "unknown sysfs value byte {other:#04x}"
        ))),
    }
}

pub(crate) fn parse_edge(raw: &str) -> Result<EdgeDetect> {
    match raw.trim() {
        "none" => Ok(EdgeDetect::None),
        "rising" => Ok(EdgeDetect::Rising),
        "falling" => Ok(EdgeDetect::Falling),
        "both" => Ok(EdgeDetect::Both),
        other => Err(GpioError::Unsupported(format!(
            "unknown sysfs edge {other:?}"
        ))),
    }
}

pub(crate) fn edge_token(edge: EdgeDetect) -> &'static str {
    match edge {
        EdgeDetect::None => "none",
        EdgeDetect::Rising => "rising",
        EdgeDetect::Falling => "falling",
        EdgeDetect::Both => "both",
    }
}
