use crate::SimResult;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

bitflags::bitflags! {
    /// USART_CR1 bits the simulator acts on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Cr1: u32 {
        const RE = 1 << 2;
        const TE = 1 << 3;
        const PS = 1 << 9;
        const PCE = 1 << 10;
        const M = 1 << 12;
        const UE = 1 << 13;
    }
}

/// SR: transmit data register empty and transmission complete.
const SR_TXE_TC: u32 = 0xC0;

/// STM32F1 USART transmitter.
///
/// Bytes written to DR leave the wire only while UE and TE are set. The line
/// never stalls, so TXE and TC always read as set.
#[derive(Debug)]
pub struct Uart {
    cr1: u32, // 0x0C
    cr2: u32, // 0x10
    brr: u32, // 0x08
    sink: Option<Arc<Mutex<Vec<u8>>>>,
    echo_stdout: bool,
    dropped: u64,
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

impl Uart {
    pub fn new() -> Self {
        Self {
            cr1: 0,
            cr2: 0,
            brr: 0,
            sink: None,
            echo_stdout: true,
            dropped: 0,
        }
    }

    pub fn set_sink(&mut self, sink: Option<Arc<Mutex<Vec<u8>>>>, echo_stdout: bool) {
        self.sink = sink;
        self.echo_stdout = echo_stdout;
    }

    pub fn control(&self) -> Cr1 {
        Cr1::from_bits_truncate(self.cr1)
    }

    pub fn brr(&self) -> u32 {
        self.brr
    }

    /// Line rate for a given peripheral clock, from BRR.
    pub fn baud(&self, pclk_hz: u32) -> Option<u32> {
        (self.brr != 0).then(|| pclk_hz / self.brr)
    }

    /// STOP field of CR2: 0 means one stop bit.
    pub fn stop_field(&self) -> u32 {
        (self.cr2 >> 12) & 0b11
    }

    /// Bytes written while the transmitter was off.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn transmitting(&self) -> bool {
        self.control().contains(Cr1::UE | Cr1::TE)
    }

    fn push_tx(&mut self, value: u8) {
        if !self.transmitting() {
            self.dropped += 1;
            tracing::debug!("USART: DR write {:#04x} with transmitter disabled", value);
            return;
        }

        if let Some(sink) = &self.sink {
            if let Ok(mut guard) = sink.lock() {
                guard.push(value);
            }
        }

        if self.echo_stdout {
            #[allow(unused_must_use)]
            {
                print!("{}", value as char);
                io::stdout().flush();
            }
        }
    }

    fn read_reg(&self, offset: u64) -> u32 {
        match offset {
            0x00 => SR_TXE_TC,
            0x08 => self.brr,
            0x0C => self.cr1,
            0x10 => self.cr2,
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) {
        match offset {
            0x08 => self.brr = value & 0xFFFF,
            0x0C => {
                self.cr1 = value & 0x3FFF;
                tracing::debug!("USART: CR1 = {:?}", self.control());
            }
            0x10 => self.cr2 = value & 0x7F7F,
            _ => {}
        }
    }
}

impl crate::Peripheral for Uart {
    fn read(&self, offset: u64) -> SimResult<u8> {
        let reg_offset = offset & !3;
        let byte_offset = (offset % 4) as u32;
        let reg_val = self.read_reg(reg_offset);
        Ok(((reg_val >> (byte_offset * 8)) & 0xFF) as u8)
    }

    fn write(&mut self, offset: u64, value: u8) -> SimResult<()> {
        // DR: only the low byte carries data.
        if offset == 0x04 {
            self.push_tx(value);
            return Ok(());
        }

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
