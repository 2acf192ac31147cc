use chipcheck_config::{ChipDescriptor, Overflow, StuckBits};

/// Value read from an address nothing drives.
pub const OPEN_BUS: u32 = 0xFFFF_FFFF;

/// Word-addressed SRAM array as the core sees it.
///
/// `size` bytes are physically present. Addresses between `size` and `span`
/// are decoded but land according to `overflow`; anything above `span` is not
/// decoded at all and floats.
#[derive(Debug, Clone)]
pub struct SramBank {
    words: Vec<u32>,
    base: u64,
    span: u64,
    overflow: Overflow,
    faults: Vec<StuckBits>,
}

impl SramBank {
    pub fn new(base: u64, size: usize, span: u64, overflow: Overflow) -> Self {
        Self {
            words: vec![0; size / 4],
            base,
            span: span.max(size as u64),
            overflow,
            faults: Vec::new(),
        }
    }

    pub fn from_config(chip: &ChipDescriptor) -> anyhow::Result<Self> {
        let size = chip.ram_size()? as usize;
        let span = chip.ram_span()?;
        let mut bank = Self::new(chip.ram.base, size, span, chip.ram.overflow);
        for fault in &chip.faults {
            bank.add_fault(fault.clone());
        }
        Ok(bank)
    }

    pub fn add_fault(&mut self, fault: StuckBits) {
        self.faults.push(fault);
    }

    /// Word slot backing `addr`, after decode.
    fn slot(&self, addr: u64) -> Option<usize> {
        if addr < self.base || self.words.is_empty() {
            return None;
        }
        let offset = addr - self.base;
        if offset >= self.span {
            return None;
        }
        let index = (offset / 4) as usize;
        if index < self.words.len() {
            return Some(index);
        }
        match self.overflow {
            Overflow::Alias => Some(index % self.words.len()),
            Overflow::Float => None,
        }
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        let Some(index) = self.slot(addr) else {
            return OPEN_BUS;
        };
        let stored = self.words[index];
        let physical = self.base + index as u64 * 4;
        self.faults
            .iter()
            .filter(|f| f.address & !3 == physical)
            .fold(stored, |v, f| (v & !f.mask) | (f.value & f.mask))
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        if let Some(index) = self.slot(addr) {
            self.words[index] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x2000_0000;

    #[test]
    fn test_backed_words_hold_values() {
        let mut bank = SramBank::new(BASE, 1024, 1024, Overflow::Alias);
        bank.write_u32(BASE, 0xDEAD_BEEF);
        bank.write_u32(BASE + 1020, 0x1234_5678);
        assert_eq!(bank.read_u32(BASE), 0xDEAD_BEEF);
        assert_eq!(bank.read_u32(BASE + 1020), 0x1234_5678);
    }

    #[test]
    fn test_alias_wraps_onto_physical_words() {
        let mut bank = SramBank::new(BASE, 1024, 2048, Overflow::Alias);
        bank.write_u32(BASE + 1024 + 8, 0xAAAA_5555);
        assert_eq!(bank.read_u32(BASE + 8), 0xAAAA_5555);
    }

    #[test]
    fn test_float_drops_writes() {
        let mut bank = SramBank::new(BASE, 1024, 2048, Overflow::Float);
        bank.write_u32(BASE + 1024, 0);
        assert_eq!(bank.read_u32(BASE + 1024), OPEN_BUS);
        assert_eq!(bank.read_u32(BASE), 0);
    }

    #[test]
    fn test_beyond_span_is_open_bus() {
        let mut bank = SramBank::new(BASE, 1024, 2048, Overflow::Alias);
        bank.write_u32(BASE + 4096, 7);
        assert_eq!(bank.read_u32(BASE + 4096), OPEN_BUS);
        assert_eq!(bank.read_u32(BASE - 4), OPEN_BUS);
    }

    #[test]
    fn test_stuck_bits_override_reads() {
        let mut bank = SramBank::new(BASE, 1024, 1024, Overflow::Alias);
        bank.add_fault(StuckBits {
            address: BASE + 16,
            mask: 0x0000_0080,
            value: 0,
        });
        bank.write_u32(BASE + 16, 0xFFFF_FFFF);
        assert_eq!(bank.read_u32(BASE + 16), 0xFFFF_FF7F);
        bank.write_u32(BASE + 20, 0xFFFF_FFFF);
        assert_eq!(bank.read_u32(BASE + 20), 0xFFFF_FFFF);
    }
}
