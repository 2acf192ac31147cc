use crate::{Peripheral, SimResult};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// Base address of the NVIC register block on Cortex-M3.
pub const NVIC_BASE: u64 = 0xE000_E100;
/// ISER through IPR.
pub const NVIC_SIZE: u64 = 0x400;

/// External interrupt lines on STM32F103 (IRQ0-IRQ67).
pub const IRQ_LINES: usize = 68;

/// Shared state for NVIC registers.
///
/// Indexed by IRQ number, not exception number: IRQ 30 is bit 30 of ISER0.
#[derive(Debug)]
pub struct NvicState {
    pub iser: [AtomicU32; 8],
    pub ispr: [AtomicU32; 8],
    pub ipr: [AtomicU8; IRQ_LINES],
}

impl Default for NvicState {
    fn default() -> Self {
        Self {
            iser: std::array::from_fn(|_| AtomicU32::new(0)),
            ispr: std::array::from_fn(|_| AtomicU32::new(0)),
            ipr: std::array::from_fn(|_| AtomicU8::new(0)),
        }
    }
}

impl NvicState {
    fn slot(irq: u32) -> Option<(usize, u32)> {
        let idx = (irq / 32) as usize;
        (idx < 8).then_some((idx, 1 << (irq % 32)))
    }

    pub fn is_enabled(&self, irq: u32) -> bool {
        match Self::slot(irq) {
            Some((idx, bit)) => (self.iser[idx].load(Ordering::SeqCst) & bit) != 0,
            None => false,
        }
    }

    pub fn is_pending(&self, irq: u32) -> bool {
        match Self::slot(irq) {
            Some((idx, bit)) => (self.ispr[idx].load(Ordering::SeqCst) & bit) != 0,
            None => false,
        }
    }

    pub fn set_pending(&self, irq: u32) {
        if let Some((idx, bit)) = Self::slot(irq) {
            self.ispr[idx].fetch_or(bit, Ordering::SeqCst);
        }
    }

    /// Clears the pending bit and reports whether it was set: the step an
    /// exception entry performs.
    pub fn take_pending(&self, irq: u32) -> bool {
        match Self::slot(irq) {
            Some((idx, bit)) => (self.ispr[idx].fetch_and(!bit, Ordering::SeqCst) & bit) != 0,
            None => false,
        }
    }

    pub fn priority(&self, irq: u32) -> u8 {
        self.ipr
            .get(irq as usize)
            .map(|p| p.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// Nested Vectored Interrupt Controller (NVIC) register block.
#[derive(Debug, Clone)]
pub struct Nvic {
    pub state: Arc<NvicState>,
}

impl Nvic {
    pub fn new(state: Arc<NvicState>) -> Self {
        Self { state }
    }
}

impl Peripheral for Nvic {
    fn read(&self, offset: u64) -> SimResult<u8> {
        let byte_offset = (offset % 4) as usize;

        let val = if offset < 0x20 {
            // ISER0-7
            self.state.iser[(offset / 4) as usize].load(Ordering::SeqCst)
        } else if (0x80..0xA0).contains(&offset) {
            // ICER0-7 read back the enable bits
            self.state.iser[((offset - 0x80) / 4) as usize].load(Ordering::SeqCst)
        } else if (0x100..0x120).contains(&offset) {
            // ISPR0-7
            self.state.ispr[((offset - 0x100) / 4) as usize].load(Ordering::SeqCst)
        } else if (0x180..0x1A0).contains(&offset) {
            // ICPR0-7
            self.state.ispr[((offset - 0x180) / 4) as usize].load(Ordering::SeqCst)
        } else if (0x300..0x300 + IRQ_LINES as u64).contains(&offset) {
            // IPR is byte addressed
            return Ok(self.state.ipr[(offset - 0x300) as usize].load(Ordering::SeqCst));
        } else {
            0
        };

        Ok(((val >> (byte_offset * 8)) & 0xFF) as u8)
    }

    fn write(&mut self, offset: u64, value: u8) -> SimResult<()> {
        let byte_offset = (offset % 4) as usize;
        let mask = (value as u32) << (byte_offset * 8);

        if offset < 0x20 {
            // ISER: Writing 1 sets the enable bit
            let idx = (offset / 4) as usize;
            self.state.iser[idx].fetch_or(mask, Ordering::SeqCst);
            if mask != 0 {
                tracing::debug!(
                    "NVIC: ISER[{}] set to {:#x}",
                    idx,
                    self.state.iser[idx].load(Ordering::SeqCst)
                );
            }
        } else if (0x80..0xA0).contains(&offset) {
            // ICER: Writing 1 clears the enable bit
            let idx = ((offset - 0x80) / 4) as usize;
            self.state.iser[idx].fetch_and(!mask, Ordering::SeqCst);
            if mask != 0 {
                tracing::debug!(
                    "NVIC: ISER[{}] cleared to {:#x}",
                    idx,
                    self.state.iser[idx].load(Ordering::SeqCst)
                );
            }
        } else if (0x100..0x120).contains(&offset) {
            // ISPR: Writing 1 sets the pending bit
            let idx = ((offset - 0x100) / 4) as usize;
            self.state.ispr[idx].fetch_or(mask, Ordering::SeqCst);
        } else if (0x180..0x1A0).contains(&offset) {
            // ICPR: Writing 1 clears the pending bit
            let idx = ((offset - 0x180) / 4) as usize;
            self.state.ispr[idx].fetch_and(!mask, Ordering::SeqCst);
        } else if (0x300..0x300 + IRQ_LINES as u64).contains(&offset) {
            // STM32F1 implements the top four priority bits.
            self.state.ipr[(offset - 0x300) as usize].store(value & 0xF0, Ordering::SeqCst);
        }

        Ok(())
    }
}
