use crate::SimResult;

/// Output mode nibble for an open-drain output at 2 MHz.
pub const MODE_OPEN_DRAIN_2MHZ: u32 = 0b0110;
/// Alternate-function push-pull at 10 MHz.
pub const MODE_AF_PUSH_PULL_10MHZ: u32 = 0b1001;
/// Input with pull-up/pull-down (direction chosen by ODR).
pub const MODE_INPUT_PULL: u32 = 0b1000;

/// STM32F1-compatible GPIO peripheral
#[derive(Debug, Default)]
pub struct GpioPort {
    crl: u32,  // 0x00: configuration register low
    crh: u32,  // 0x04: configuration register high
    idr: u32,  // 0x08: input data register
    odr: u32,  // 0x0C: output data register
    lckr: u32, // 0x18: configuration lock register

    // Output level changes seen per pin.
    edges: [u64; 16],
}

impl GpioPort {
    pub fn new() -> Self {
        Self {
            crl: 0x4444_4444, // Reset value: floating input
            crh: 0x4444_4444, // Reset value: floating input
            ..Default::default()
        }
    }

    /// Configuration nibble of `pin`.
    pub fn mode(&self, pin: u8) -> u32 {
        let reg = if pin < 8 { self.crl } else { self.crh };
        (reg >> ((pin as u32 % 8) * 4)) & 0xF
    }

    pub fn is_output(&self, pin: u8) -> bool {
        self.mode(pin) & 0b11 != 0
    }

    /// Driven level of `pin`. Only meaningful when the pin is an output.
    pub fn output_high(&self, pin: u8) -> bool {
        (self.odr >> pin) & 1 != 0
    }

    pub fn edges(&self, pin: u8) -> u64 {
        self.edges[pin as usize]
    }

    fn set_odr(&mut self, value: u32) {
        let value = value & 0xFFFF;
        let changed = self.odr ^ value;
        for (pin, edges) in self.edges.iter_mut().enumerate() {
            if (changed >> pin) & 1 != 0 {
                *edges += 1;
            }
        }
        self.odr = value;
        // Outputs read back through the input buffer.
        self.idr = value;
    }

    fn read_reg(&self, offset: u64) -> u32 {
        match offset {
            0x00 => self.crl,
            0x04 => self.crh,
            0x08 => self.idr,
            0x0C => self.odr,
            0x18 => self.lckr,
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) {
        match offset {
            0x00 => self.crl = value,
            0x04 => self.crh = value,
            0x0C => self.set_odr(value),
            0x10 => {
                // BSRR: set wins when both halves name the same pin.
                let set = value & 0xFFFF;
                let reset = (value >> 16) & 0xFFFF;
                self.set_odr((self.odr & !reset) | set);
            }
            0x14 => {
                // BRR: Bit Reset Register
                let reset = value & 0xFFFF;
                self.set_odr(self.odr & !reset);
            }
            0x18 => self.lckr = value,
            _ => {}
        }
    }
}

impl crate::Peripheral for GpioPort {
    fn read(&self, offset: u64) -> SimResult<u8> {
        let reg_offset = offset & !3;
        let byte_offset = (offset % 4) as u32;
        let reg_val = self.read_reg(reg_offset);
        Ok(((reg_val >> (byte_offset * 8)) & 0xFF) as u8)
    }

    fn write(&mut self, offset: u64, value: u8) -> SimResult<()> {
        let reg_offset = offset & !3;
        let byte_offset = (offset % 4) as u32;

        // BSRR and BRR read as zero, so the merged word only carries the
        // bits of this byte and each byte lane acts on its own pins.
        let mut reg_val = match reg_offset {
            0x10 | 0x14 => 0,
            _ => self.read_reg(reg_offset),
        };

        let mask = 0xFF << (byte_offset * 8);
        reg_val &= !mask;
        reg_val |= (value as u32) << (byte_offset * 8);

        self.write_reg(reg_offset, reg_val);
        Ok(())
    }

    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }
}
