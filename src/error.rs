use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Pin {pin} out of range (pin count is {pin_count})")]
    PinOutOfRange { pin: u32, pin_count: u32 },
    #[error("Pin {0} is not open")]
    PinNotOpen(u32),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("I/O error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GpioError {
    pub fn io(op: &'static str, source: io::Error) -> Self {
        GpioError::Io { op, source }
    }

    /// Platform error code carried by an I/O failure, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            GpioError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GpioError>;
