use core::time::Duration;

use crate::hal::{Indicator, Level, PeriodicTimer, SerialTx};

/// Byte written to the serial line on every heartbeat.
pub const HEARTBEAT_BYTE: u8 = b'.';

/// Time between heartbeat firings, and between LED toggles.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    On,
    Off,
}

impl Phase {
    pub fn toggled(self) -> Self {
        match self {
            Phase::On => Phase::Off,
            Phase::Off => Phase::On,
        }
    }

    pub fn level(self) -> Level {
        match self {
            Phase::On => Level::On,
            Phase::Off => Level::Off,
        }
    }
}

/// Blinks the indicators from the timer's update interrupt.
///
/// The fact that this runs at all is the timer check: on a part without the
/// timer it is never called and the LEDs stay dark. It owns only its phase
/// flag and never touches the memory under test.
pub struct Heartbeat<T, I, S> {
    timer: T,
    leds: I,
    serial: S,
    phase: Phase,
    firings: u64,
}

impl<T: PeriodicTimer, I: Indicator, S: SerialTx> Heartbeat<T, I, S> {
    pub fn new(timer: T, leds: I, serial: S) -> Self {
        Self {
            timer,
            leds,
            serial,
            phase: Phase::Off,
            firings: 0,
        }
    }

    /// Handler body for one timer update.
    pub fn fire(&mut self) {
        // Acknowledge first, or the line stays asserted and we re-enter.
        self.timer.clear_pending();

        self.phase = self.phase.toggled();
        self.leds.set(self.phase.level());

        self.serial.transmit(HEARTBEAT_BYTE);
        self.firings = self.firings.wrapping_add(1);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn firings(&self) -> u64 {
        self.firings
    }
}
