//! Startup order and the foreground loop.

use crate::hal::{
    Indicator, InterruptControl, MemoryCells, Parity, PeriodicTimer, SerialConfig, SerialTx,
};
use crate::heartbeat::{Heartbeat, HEARTBEAT_PERIOD};
use crate::latch::{FailureLatch, Latched};
use crate::memtest::{MemoryTest, Window};
use crate::prng::Xorshift32;

/// 9600 baud, 8N1.
pub const SERIAL_CONFIG: SerialConfig = SerialConfig {
    baud: 9600,
    data_bits: 8,
    parity: Parity::None,
    stop_bits: 1,
};

/// Everything the engine needs from the platform, already brought up
/// (clocks running, statics initialised).
///
/// The indicators appear twice: one handle for the heartbeat, one for the
/// failure latch. Both must drive the same pins.
pub struct Board<M, T, I, S, C> {
    pub cells: M,
    pub window: Window,
    pub timer: T,
    pub heartbeat_leds: I,
    pub latch_leds: I,
    pub serial: S,
    pub irq: C,
}

/// Configures the serial line, the indicators and the timer, in that order,
/// and splits the board into its two execution contexts.
///
/// Heartbeat delivery stays masked. Install the returned [`Heartbeat`] where
/// the timer handler can reach it, then call [`Diagnostic::arm`].
pub fn configure<M, T, I, S, C>(
    board: Board<M, T, I, S, C>,
) -> (Heartbeat<T, I, S>, Diagnostic<M, C, I>)
where
    M: MemoryCells,
    T: PeriodicTimer,
    I: Indicator,
    S: SerialTx,
    C: InterruptControl,
{
    let Board {
        cells,
        window,
        mut timer,
        mut heartbeat_leds,
        latch_leds,
        mut serial,
        irq,
    } = board;

    serial.configure(SERIAL_CONFIG);
    heartbeat_leds.configure();
    timer.start(HEARTBEAT_PERIOD);

    let heartbeat = Heartbeat::new(timer, heartbeat_leds, serial);
    let diagnostic = Diagnostic {
        memtest: MemoryTest::new(cells, window, Xorshift32::default()),
        latch: FailureLatch::new(irq, latch_leds),
        passes: 0,
    };
    (heartbeat, diagnostic)
}

/// Foreground half: the memory test plus the latch it feeds.
pub struct Diagnostic<M, C, I> {
    memtest: MemoryTest<M>,
    latch: FailureLatch<C, I>,
    passes: u64,
}

impl<M: MemoryCells, C: InterruptControl, I: Indicator> Diagnostic<M, C, I> {
    /// Unmasks heartbeat delivery.
    pub fn arm(&mut self) {
        self.latch.interrupts().enable_heartbeat();
    }

    /// Runs one fill/verify pass. A failure engages the latch and consumes
    /// the diagnostic, so nothing can run after it.
    pub fn step(mut self) -> Result<Self, Latched> {
        match self.memtest.run_pass() {
            Ok(()) => {
                self.passes += 1;
                Ok(self)
            }
            Err(corruption) => Err(self.latch.engage(corruption)),
        }
    }

    /// Runs passes until the memory fails. On good memory this never
    /// returns.
    pub fn run(mut self) -> Latched {
        let corruption = self.memtest.run();
        self.latch.engage(corruption)
    }

    /// Completed passes counted by [`step`](Self::step).
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn generator_state(&self) -> u32 {
        self.memtest.generator().state()
    }

    pub fn window(&self) -> Window {
        self.memtest.window()
    }

    pub fn memory(&self) -> &M {
        self.memtest.cells()
    }
}
