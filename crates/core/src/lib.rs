pub mod board;
pub mod bus;
pub mod machine;
pub mod memory;
pub mod metrics;
pub mod peripherals;
pub mod snapshot;

use std::any::Any;

use chipcheck_config::StopReason;
use chipcheck_selftest::{Corruption, Phase};


#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("No peripheral mapped at {0:#x}")]
    Unmapped(u64),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Interrupt thread failed: {0}")]
    InterruptThread(String),
}

pub type SimResult<T> = Result<T, SimulationError>;

/// Trait for observing simulation events in a modular way.
///
/// Heartbeat events arrive on the interrupt thread, everything else on the
/// thread that called [`machine::Machine::run`].
pub trait SimulationObserver: std::fmt::Debug + Send + Sync {
    fn on_run_start(&self, _chip: &str) {}
    fn on_run_stop(&self, _reason: StopReason) {}
    fn on_pass_complete(&self, _pass: u64, _cells: usize) {}
    fn on_heartbeat(&self, _firing: u64, _phase: Phase) {}
    fn on_latch(&self, _corruption: &Corruption) {}
}

/// Trait representing a memory-mapped peripheral
pub trait Peripheral: std::fmt::Debug + Send {
    fn read(&self, offset: u64) -> SimResult<u8>;
    fn write(&mut self, offset: u64, value: u8) -> SimResult<()>;
    /// Advances the peripheral clock by `cycles` bus cycles. Returns the
    /// level of its interrupt request line afterwards.
    fn advance(&mut self, _cycles: u64) -> bool {
        false
    }
    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }
}

/// Trait representing the system bus
pub trait Bus {
    fn read_u8(&self, addr: u64) -> SimResult<u8>;
    fn write_u8(&mut self, addr: u64, value: u8) -> SimResult<()>;
    fn advance(&mut self, cycles: u64) -> Vec<u32>; // Returns IRQ lines raised

    fn read_u16(&self, addr: u64) -> SimResult<u16> {
        let b0 = self.read_u8(addr)? as u16;
        let b1 = self.read_u8(addr + 1)? as u16;
        // Little Endian
        Ok(b0 | (b1 << 8))
    }

    fn read_u32(&self, addr: u64) -> SimResult<u32> {
        let b0 = self.read_u8(addr)? as u32;
        let b1 = self.read_u8(addr + 1)? as u32;
        let b2 = self.read_u8(addr + 2)? as u32;
        let b3 = self.read_u8(addr + 3)? as u32;
        Ok(b0 | (b1 << 8) | (b2 << 16) | (b3 << 24))
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> SimResult<()> {
        self.write_u8(addr, (value & 0xFF) as u8)?;
        self.write_u8(addr + 1, ((value >> 8) & 0xFF) as u8)?;
        self.write_u8(addr + 2, ((value >> 16) & 0xFF) as u8)?;
        self.write_u8(addr + 3, ((value >> 24) & 0xFF) as u8)?;
        Ok(())
    }

    fn write_u16(&mut self, addr: u64, value: u16) -> SimResult<()> {
        self.write_u8(addr, (value & 0xFF) as u8)?;
        self.write_u8(addr + 1, ((value >> 8) & 0xFF) as u8)?;
        Ok(())
    }
}
