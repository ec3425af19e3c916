use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::error::{GpioError, Result};

/// Driver-side bookkeeping for a single pin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinRecord {
    pub exported: bool,
    pub debounce: Duration,
    /// Set once the debounce was chosen explicitly rather than taken from config.
    pub(crate) debounce_set: bool,
    /// Last edge accepted by the event detection worker.
    pub last_event: Option<Instant>,
    /// Last edge accepted by a blocking wait, kept apart from the worker's.
    pub last_wait_event: Option<Instant>,
    /// Open `value` file while the pin is armed in the shared multiplexer.
    pub value_fd: Option<RawFd>,
    pub events_enabled: bool,
    /// Set while the readiness reported on registration has not been consumed yet.
    pub(crate) swallow_initial: bool,
}

impl PinRecord {
    fn reset(&mut self) {
        *self = PinRecord::default();
    }
}

#[derive(Debug)]
pub struct PinTable {
    records: Vec<PinRecord>,
}

impl PinTable {
    pub fn new(pin_count: u32) -> Self {
        Self {
            records: vec![PinRecord::default(); pin_count as usize],
        }
    }

    pub fn pin_count(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn check_range(&self, pin: u32) -> Result<()> {
        if pin < self.pin_count() {
            Ok(())
        } else {
            Err(GpioError::PinOutOfRange {
                pin,
                pin_count: self.pin_count(),
            })
        }
    }

    pub fn get(&self, pin: u32) -> Result<&PinRecord> {
        self.check_range(pin)?;
        Ok(&self.records[pin as usize])
    }

    pub fn get_mut(&mut self, pin: u32) -> Result<&mut PinRecord> {
        self.check_range(pin)?;
        Ok(&mut self.records[pin as usize])
    }

    pub fn reset(&mut self, pin: u32) -> Result<()> {
        self.get_mut(pin)?.reset();
        Ok(())
    }

    /// Pins that still hold any kernel-side resource.
    pub fn pins_in_use(&self) -> Vec<u32> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.exported || r.events_enabled || r.value_fd.is_some())
            .map(|(pin, _)| pin as u32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_pin_equal_to_count() {
        let table = PinTable::new(4);
        assert!(table.get(3).is_ok());
        assert!(matches!(
            table.get(4),
            Err(GpioError::PinOutOfRange {
                pin: 4,
                pin_count: 4
            })
        ));
    }

    #[test]
    fn reset_restores_defaults() {
        let mut table = PinTable::new(2);
        {
            let record = table.get_mut(1).unwrap();
            record.exported = true;
            record.debounce = Duration::from_millis(5);
            record.last_event = Some(Instant::now());
        }
        assert_eq!(table.pins_in_use(), vec![1]);

        table.reset(1).unwrap();
        assert_eq!(table.get(1).unwrap(), &PinRecord::default());
        assert!(table.pins_in_use().is_empty());
    }
}
