//! Capability interfaces the engine needs from the platform.
//!
//! The firmware implements these with raw STM32F103 register writes; the
//! simulator implements them against its modelled peripherals. Nothing in
//! the engine touches a register directly.

use core::time::Duration;

/// Drive level of an indicator output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    /// Heartbeat phase, LED lit.
    On,
    /// Heartbeat phase, LED dark.
    Off,
    /// Failure latch. Lit like `On`, but never toggled again.
    Fault,
}

impl Level {
    /// Whether the LED is lit. The indicator pins are active low, so this is
    /// also whether the pin is pulled LOW.
    pub fn is_lit(self) -> bool {
        !matches!(self, Level::Off)
    }
}

/// One indicator output, or a group of them driven in lockstep.
pub trait Indicator {
    /// Put the pin(s) into output mode, dark.
    fn configure(&mut self);
    fn set(&mut self, level: Level);
}

/// Redundant pins (one per package variant) are driven identically.
impl<I: Indicator, const N: usize> Indicator for [I; N] {
    fn configure(&mut self) {
        for led in self.iter_mut() {
            led.configure();
        }
    }

    fn set(&mut self, level: Level) {
        for led in self.iter_mut() {
            led.set(level);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Line settings for the serial transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

/// Transmit half of a UART.
pub trait SerialTx {
    fn configure(&mut self, config: SerialConfig);

    /// Loads `byte` into the transmit register without waiting. If the
    /// transmitter is still busy the byte may be lost; callers accept that.
    fn transmit(&mut self, byte: u8);
}

/// A hardware timer that raises a recurring update signal.
pub trait PeriodicTimer {
    /// Programs the timer to signal every `period` and starts it counting.
    fn start(&mut self, period: Duration);

    /// Acknowledges the current update. Must be called from every handler
    /// invocation or the signal fires again immediately.
    fn clear_pending(&mut self);
}

/// Delivery of asynchronous signals to the heartbeat.
pub trait InterruptControl {
    /// Sets priority, clears any stale pending state and unmasks the timer
    /// line.
    fn enable_heartbeat(&mut self);

    /// Masks all asynchronous delivery. When this returns, no heartbeat
    /// handler is running and none will run again.
    fn disable_all(&mut self);
}

/// Word-addressed access to the memory under test.
///
/// Implementations must perform every access for real (volatile on hardware);
/// caching a written value would defeat the test.
pub trait MemoryCells {
    fn write(&mut self, addr: u32, value: u32);
    fn read(&mut self, addr: u32) -> u32;
}

impl<M: MemoryCells + ?Sized> MemoryCells for &mut M {
    fn write(&mut self, addr: u32, value: u32) {
        (**self).write(addr, value)
    }

    fn read(&mut self, addr: u32) -> u32 {
        (**self).read(addr)
    }
}

/// Convenience for implementors: the timer is programmed in whole
/// microseconds.
pub fn period_micros(period: Duration) -> u32 {
    u32::try_from(period.as_micros()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Pin {
        configured: bool,
        level: Option<Level>,
    }

    impl Indicator for Pin {
        fn configure(&mut self) {
            self.configured = true;
        }

        fn set(&mut self, level: Level) {
            self.level = Some(level);
        }
    }

    #[test]
    fn test_indicator_array_drives_all_pins() {
        let mut pins: [Pin; 2] = Default::default();
        pins.configure();
        pins.set(Level::Fault);

        for pin in &pins {
            assert!(pin.configured);
            assert_eq!(pin.level, Some(Level::Fault));
        }
    }

    #[test]
    fn test_level_lit() {
        assert!(Level::On.is_lit());
        assert!(Level::Fault.is_lit());
        assert!(!Level::Off.is_lit());
    }

    #[test]
    fn test_period_micros() {
        assert_eq!(period_micros(Duration::from_millis(500)), 500_000);
        assert_eq!(period_micros(Duration::from_secs(u64::MAX)), u32::MAX);
    }
}
