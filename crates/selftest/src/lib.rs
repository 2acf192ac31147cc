//! Diagnostic engine for telling genuine STM32F103 parts from remarked or
//! cloned ones.
//!
//! Two things are checked at once:
//!
//! - a timer peripheral (TIM4 on the real part) drives a [`Heartbeat`] that
//!   blinks the indicator LEDs and emits a `.` on the serial line. A chip
//!   without the timer never blinks.
//! - the foreground [`MemoryTest`] fills the SRAM window up to the advertised
//!   capacity with a pseudorandom sequence and reads it back, forever. The
//!   first mismatch engages the [`FailureLatch`], which freezes the heartbeat
//!   and leaves the LEDs solid.
//!
//! All hardware access goes through the traits in [`hal`], so the same engine
//! runs on the chip and against the simulator in `chipcheck-core`.

#![cfg_attr(not(test), no_std)]

pub mod diagnostic;
pub mod hal;
pub mod heartbeat;
pub mod latch;
pub mod memtest;
pub mod prng;

mod tests;

pub use diagnostic::{configure, Board, Diagnostic, SERIAL_CONFIG};
pub use hal::{
    Indicator, InterruptControl, Level, MemoryCells, Parity, PeriodicTimer, SerialConfig, SerialTx,
};
pub use heartbeat::{Heartbeat, Phase, HEARTBEAT_BYTE, HEARTBEAT_PERIOD};
pub use latch::{FailureLatch, Latched};
pub use memtest::{Corruption, MemoryTest, Window, CELL_BYTES, REQUIRED_RAM, SRAM_BASE};
pub use prng::{Checkpoint, Xorshift32, SEED};
