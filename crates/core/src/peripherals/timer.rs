use crate::SimResult;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Cr1: u32 {
        const CEN = 1 << 0;
        const UDIS = 1 << 1;
        const URS = 1 << 2;
        const OPM = 1 << 3;
        const ARPE = 1 << 7;
    }
}

/// DIER.UIE and SR.UIF share bit 0.
const UPDATE: u32 = 1;

/// STM32 general purpose timer (TIM2-TIM5 compatible), upcounting only.
///
/// PSC is buffered: a new prescaler takes effect at the next update event,
/// as on silicon. ARR writes apply immediately (ARPE is not modelled).
#[derive(Debug, Default)]
pub struct Timer {
    cr1: u32,
    cr2: u32,
    dier: u32,
    sr: u32,
    cnt: u32,
    psc: u32,
    arr: u32,

    // Internal state
    psc_active: u32,
    psc_cnt: u64,
    updates: u64,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            arr: 0xFFFF, // Default reset value
            ..Default::default()
        }
    }

    pub fn control(&self) -> Cr1 {
        Cr1::from_bits_truncate(self.cr1)
    }

    pub fn prescaler(&self) -> u32 {
        self.psc
    }

    pub fn reload(&self) -> u32 {
        self.arr
    }

    pub fn counter(&self) -> u32 {
        self.cnt
    }

    /// Update events since reset, including ones from EGR.UG.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn irq_level(&self) -> bool {
        (self.sr & UPDATE) != 0 && (self.dier & UPDATE) != 0
    }

    fn update_event(&mut self, software: bool) {
        self.cnt = 0;
        self.psc_cnt = 0;
        self.psc_active = self.psc;
        self.updates += 1;
        if !(software && self.control().contains(Cr1::URS)) {
            self.sr |= UPDATE;
        }
        if !software && self.control().contains(Cr1::OPM) {
            self.cr1 &= !Cr1::CEN.bits();
        }
    }

    fn count(&mut self, cycles: u64) {
        let mut remaining = cycles;
        while remaining > 0 && self.control().contains(Cr1::CEN) {
            let div = self.psc_active as u64 + 1;
            let ticks_to_update = (self.arr as u64 + 1).saturating_sub(self.cnt as u64).max(1);
            let cycles_to_update = ticks_to_update * div - self.psc_cnt;

            if remaining < cycles_to_update {
                let total = self.psc_cnt + remaining;
                self.cnt += (total / div) as u32;
                self.psc_cnt = total % div;
                return;
            }

            remaining -= cycles_to_update;
            if self.control().contains(Cr1::UDIS) {
                self.cnt = 0;
                self.psc_cnt = 0;
                continue;
            }
            self.update_event(false);

            // Whole periods at the now-stable prescaler collapse into one
            // pending flag.
            let period = (self.psc_active as u64 + 1) * (self.arr as u64 + 1);
            if remaining >= period && !self.control().contains(Cr1::OPM) {
                self.updates += remaining / period;
                remaining %= period;
            }
        }
    }

    fn read_reg(&self, offset: u64) -> u32 {
        match offset {
            0x00 => self.cr1,
            0x04 => self.cr2,
            0x0C => self.dier,
            0x10 => self.sr,
            0x24 => self.cnt,
            0x28 => self.psc,
            0x2C => self.arr,
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) {
        match offset {
            0x00 => self.cr1 = value & 0x3FF,
            0x04 => self.cr2 = value & 0xF8,
            0x0C => self.dier = value & 0x5F5F,
            // TIMx_SR is rc_w0 for status flags: writing 0 clears, writing 1 keeps current.
            0x10 => self.sr &= value & 0x1E5F,
            // TIMx_EGR: only UG (bit 0) is modelled.
            0x14 => {
                if (value & 0x1) != 0 {
                    self.update_event(true);
                }
            }
            0x24 => self.cnt = value & 0xFFFF,
            0x28 => self.psc = value & 0xFFFF,
            0x2C => self.arr = value & 0xFFFF,
            _ => {}
        }
    }
}

impl crate::Peripheral for Timer {
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

    fn advance(&mut self, cycles: u64) -> bool {
        if self.arr != 0 {
            self.count(cycles);
        }
        // The request line follows UIF while UIE is set.
        self.irq_level()
    }

    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }
}
