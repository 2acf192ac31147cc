use crate::peripherals::nvic::{Nvic, NvicState, NVIC_BASE, NVIC_SIZE};
use crate::{Peripheral, SimResult, SimulationError};
use chipcheck_config::{parse_size, ChipDescriptor};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub struct PeripheralEntry {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub irq: Option<u32>,
    pub dev: Box<dyn Peripheral>,
}

impl PeripheralEntry {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

/// Peripheral address space of the simulated part.
///
/// SRAM is not on this bus: it belongs to the foreground context alone. The
/// NVIC is always present, whatever the descriptor lists.
#[derive(Debug)]
pub struct SystemBus {
    pub peripherals: Vec<PeripheralEntry>,
    pub nvic: Arc<NvicState>,
}

impl Default for SystemBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemBus {
    pub fn new() -> Self {
        let nvic = Arc::new(NvicState::default());
        Self {
            peripherals: vec![PeripheralEntry {
                name: "nvic".to_string(),
                base: NVIC_BASE,
                size: NVIC_SIZE,
                irq: None,
                dev: Box::new(Nvic::new(nvic.clone())),
            }],
            nvic,
        }
    }

    pub fn from_config(chip: &ChipDescriptor) -> anyhow::Result<Self> {
        let mut bus = Self::new();

        for p_cfg in &chip.peripherals {
            let dev: Box<dyn Peripheral> = match p_cfg.r#type.as_str() {
                "gpio" => Box::new(crate::peripherals::gpio::GpioPort::new()),
                "uart" => Box::new(crate::peripherals::uart::Uart::new()),
                "timer" => Box::new(crate::peripherals::timer::Timer::new()),
                "rcc" => Box::new(crate::peripherals::rcc::Rcc::new()),
                "nvic" => {
                    if p_cfg.base_address != NVIC_BASE {
                        anyhow::bail!(
                            "NVIC '{}' must sit at {:#x}, not {:#x}",
                            p_cfg.id,
                            NVIC_BASE,
                            p_cfg.base_address
                        );
                    }
                    continue;
                }
                other => {
                    tracing::warn!(
                        "Unsupported peripheral type '{}' for id '{}'; skipping",
                        other,
                        p_cfg.id
                    );
                    continue;
                }
            };

            let size = if let Some(size) = &p_cfg.size {
                parse_size(size)?
            } else {
                0x400 // STM32F1 APB peripherals occupy 1 KiB each
            };

            bus.map(&p_cfg.id, p_cfg.base_address, size, p_cfg.irq, dev)?;
        }

        Ok(bus)
    }

    /// Adds a peripheral window. Overlapping windows are rejected.
    pub fn map(
        &mut self,
        name: &str,
        base: u64,
        size: u64,
        irq: Option<u32>,
        dev: Box<dyn Peripheral>,
    ) -> SimResult<()> {
        let end = base.checked_add(size).ok_or_else(|| {
            SimulationError::InvalidConfig(format!(
                "peripheral '{}' at {:#x} (+{:#x}) wraps the address space",
                name, base, size
            ))
        })?;
        // Mapped windows were checked on the way in, so their ends cannot wrap.
        if let Some(other) = self
            .peripherals
            .iter()
            .find(|p| base < p.base + p.size && p.base < end)
        {
            return Err(SimulationError::InvalidConfig(format!(
                "peripheral '{}' at {:#x} overlaps '{}' at {:#x}",
                name, base, other.name, other.base
            )));
        }

        tracing::debug!("Mapped {} at {:#x} (+{:#x}) irq={:?}", name, base, size, irq);
        self.peripherals.push(PeripheralEntry {
            name: name.to_string(),
            base,
            size,
            irq,
            dev,
        });
        Ok(())
    }

    pub fn entry_at(&self, addr: u64) -> Option<&PeripheralEntry> {
        self.peripherals.iter().find(|p| p.contains(addr))
    }

    /// Concrete peripheral mapped at `base`, if it has that type.
    pub fn device_at<T: 'static>(&self, base: u64) -> Option<&T> {
        self.peripherals
            .iter()
            .find(|p| p.base == base)
            .and_then(|p| p.dev.as_any())
            .and_then(|any| any.downcast_ref::<T>())
    }

    /// Attach a UART TX capture sink to any UART peripherals on this bus.
    ///
    /// When `echo_stdout` is false, UART writes will no longer be printed to stdout.
    pub fn attach_uart_tx_sink(&mut self, sink: Arc<Mutex<Vec<u8>>>, echo_stdout: bool) {
        for p in &mut self.peripherals {
            let Some(any) = p.dev.as_any_mut() else {
                continue;
            };
            let Some(uart) = any.downcast_mut::<crate::peripherals::uart::Uart>() else {
                continue;
            };
            uart.set_sink(Some(sink.clone()), echo_stdout);
        }
    }
}

impl crate::Bus for SystemBus {
    fn read_u8(&self, addr: u64) -> SimResult<u8> {
        match self.entry_at(addr) {
            Some(p) => p.dev.read(addr - p.base),
            None => Err(SimulationError::Unmapped(addr)),
        }
    }

    fn write_u8(&mut self, addr: u64, value: u8) -> SimResult<()> {
        match self.peripherals.iter_mut().find(|p| p.contains(addr)) {
            Some(p) => p.dev.write(addr - p.base, value),
            None => Err(SimulationError::Unmapped(addr)),
        }
    }

    fn advance(&mut self, cycles: u64) -> Vec<u32> {
        let mut raised = Vec::new();
        for p in &mut self.peripherals {
            if p.dev.advance(cycles) {
                if let Some(irq) = p.irq {
                    self.nvic.set_pending(irq);
                    raised.push(irq);
                }
            }
        }
        raised
    }
}
