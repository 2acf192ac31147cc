use crate::hal::{Indicator, InterruptControl, Level};
use crate::memtest::Corruption;

/// Terminal state for a failed memory test.
///
/// Holds its own handle to the indicator outputs. The heartbeat drives the
/// same pins, which is safe only because [`engage`](Self::engage) masks
/// delivery before it writes them.
pub struct FailureLatch<C, I> {
    irq: C,
    leds: I,
}

impl<C: InterruptControl, I: Indicator> FailureLatch<C, I> {
    pub fn new(irq: C, leds: I) -> Self {
        Self { irq, leds }
    }

    /// One-way transition. Freezes the heartbeat, then leaves the LEDs solid.
    pub fn engage(mut self, corruption: Corruption) -> Latched {
        self.irq.disable_all();
        self.leds.set(Level::Fault);
        Latched { corruption }
    }

    pub(crate) fn interrupts(&mut self) -> &mut C {
        &mut self.irq
    }
}

/// Proof that the latch was engaged. There is no way back short of a reset.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct Latched {
    corruption: Corruption,
}

impl Latched {
    pub fn corruption(&self) -> Corruption {
        self.corruption
    }

    /// Does nothing, forever.
    pub fn idle(self) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }
}
