use crate::SimResult;

bitflags::bitflags! {
    /// RCC_APB2ENR
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Apb2: u32 {
        const AFIO = 1 << 0;
        const IOPA = 1 << 2;
        const IOPB = 1 << 3;
        const IOPC = 1 << 4;
        const USART1 = 1 << 14;
    }
}

bitflags::bitflags! {
    /// RCC_APB1ENR
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Apb1: u32 {
        const TIM2 = 1 << 0;
        const TIM3 = 1 << 1;
        const TIM4 = 1 << 2;
    }
}

const CR_HSEON: u32 = 1 << 16;
const CR_HSERDY: u32 = 1 << 17;
const CR_PLLON: u32 = 1 << 24;
const CR_PLLRDY: u32 = 1 << 25;

/// STM32F1 Reset and Clock Control.
///
/// Oscillators and the PLL report ready as soon as they are switched on, and
/// SWS follows SW immediately.
#[derive(Debug)]
pub struct Rcc {
    cr: u32,      // 0x00
    cfgr: u32,    // 0x04
    ahbenr: u32,  // 0x14
    apb2enr: u32, // 0x18
    apb1enr: u32, // 0x1C
}

impl Default for Rcc {
    fn default() -> Self {
        Self::new()
    }
}

impl Rcc {
    pub fn new() -> Self {
        Self {
            cr: 0x0000_0083, // HSION | HSIRDY, trim 16
            cfgr: 0,
            ahbenr: 0x0000_0014,
            apb2enr: 0,
            apb1enr: 0,
        }
    }

    pub fn apb2(&self) -> Apb2 {
        Apb2::from_bits_truncate(self.apb2enr)
    }

    pub fn apb1(&self) -> Apb1 {
        Apb1::from_bits_truncate(self.apb1enr)
    }

    /// SW field of CFGR (0 = HSI, 1 = HSE, 2 = PLL).
    pub fn system_clock_source(&self) -> u32 {
        self.cfgr & 0b11
    }

    fn read_reg(&self, offset: u64) -> u32 {
        match offset {
            0x00 => self.cr,
            0x04 => {
                // SWS mirrors SW.
                let sw = self.cfgr & 0b11;
                (self.cfgr & !0b1100) | (sw << 2)
            }
            0x14 => self.ahbenr,
            0x18 => self.apb2enr,
            0x1C => self.apb1enr,
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) {
        match offset {
            0x00 => {
                let mut cr = (value & !(CR_HSERDY | CR_PLLRDY)) | 0b11;
                if cr & CR_HSEON != 0 {
                    cr |= CR_HSERDY;
                }
                if cr & CR_PLLON != 0 {
                    cr |= CR_PLLRDY;
                }
                self.cr = cr;
            }
            0x04 => self.cfgr = value & !0b1100,
            0x14 => self.ahbenr = value,
            0x18 => {
                self.apb2enr = value;
                tracing::debug!("RCC: APB2ENR = {:?}", self.apb2());
            }
            0x1C => {
                self.apb1enr = value;
                tracing::debug!("RCC: APB1ENR = {:?}", self.apb1());
            }
            _ => {}
        }
    }
}

impl crate::Peripheral for Rcc {
    fn read(&self, offset: u64) -> SimResult<u8> {
        let reg_offset = offset & !3;
        let byte_offset = (offset % 4) as u32;
        let reg_val = self.read_reg(reg_offset);
        Ok(((reg_val >> (byte_offset * 8)) & 0xFF) as u8)
    }

    fn write(&mut self, offset: u64, value: u8) -> SimResult<()> {
        let reg_offset = offset & !3;
        let byte_offset = (offset % 4) as u32;
        let mut reg_val = self.read_reg(reg_offset);

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Peripheral;

    #[test]
    fn test_pll_reports_ready() {
        let mut rcc = Rcc::new();
        rcc.write(0x03, 0x01).unwrap(); // PLLON
        assert_eq!(rcc.read(0x03).unwrap() & 0x02, 0x02);
    }

    #[test]
    fn test_sws_follows_sw() {
        let mut rcc = Rcc::new();
        rcc.write(0x04, 0x02).unwrap();
        assert_eq!(rcc.read(0x04).unwrap() & 0x0F, 0x0A);
        assert_eq!(rcc.system_clock_source(), 2);
    }

    #[test]
    fn test_clock_enables() {
        let mut rcc = Rcc::new();
        rcc.write(0x18, 0x1C).unwrap();
        rcc.write(0x19, 0x40).unwrap();
        rcc.write(0x1C, 0x04).unwrap();
        assert!(rcc.apb2().contains(Apb2::IOPA | Apb2::IOPB | Apb2::IOPC | Apb2::USART1));
        assert!(rcc.apb1().contains(Apb1::TIM4));
    }
}
