//! STM32F103 bindings for the self-test engine.
//!
//! Each type performs the same register sequence the firmware does, against
//! the simulated bus. Accesses to blocks the chip does not have read as zero
//! and drop writes, which is how a clone without TIM4 behaves.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chipcheck_selftest::hal::period_micros;
use chipcheck_selftest::{
    Board, Indicator, InterruptControl, Level, MemoryCells, Parity, PeriodicTimer, SerialConfig,
    SerialTx, Window,
};
use serde::{Deserialize, Serialize};

use crate::bus::SystemBus;
use crate::memory::SramBank;
use crate::peripherals::gpio::{
    GpioPort, MODE_AF_PUSH_PULL_10MHZ, MODE_INPUT_PULL, MODE_OPEN_DRAIN_2MHZ,
};
use crate::peripherals::nvic::NVIC_BASE;
use crate::peripherals::rcc::{Apb1, Apb2};
use crate::peripherals::timer::Cr1 as TimCr1;
use crate::peripherals::uart::{Cr1 as UsartCr1, Uart};
use crate::Bus;

pub const RCC_BASE: u64 = 0x4002_1000;
pub const GPIOA_BASE: u64 = 0x4001_0800;
pub const GPIOB_BASE: u64 = 0x4001_0C00;
pub const GPIOC_BASE: u64 = 0x4001_1000;
pub const USART1_BASE: u64 = 0x4001_3800;
pub const TIM4_BASE: u64 = 0x4000_0800;
pub const TIM4_IRQ: u32 = 30;

/// NVIC priority of the heartbeat, in the implemented top four bits.
const TIMER_IRQ_PRI: u8 = 1;

/// The LEDs, both wired to VDD through a resistor: driving low lights them.
pub const INDICATORS: [(&str, u64, u8); 2] = [("PB12", GPIOB_BASE, 12), ("PC13", GPIOC_BASE, 13)];

pub type SharedBus = Arc<Mutex<SystemBus>>;

pub type SimBoard = Board<SimSram, SimTimer, [SimLed; 2], SimSerial, SimIrq>;

/// Locks a mutex, taking over the data if a panicking thread left it
/// poisoned. The register file stays consistent between single accesses.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_reg(bus: &SystemBus, addr: u64) -> u32 {
    match bus.read_u32(addr) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("read {:#x}: {}; reads as zero", addr, e);
            0
        }
    }
}

fn write_reg(bus: &mut SystemBus, addr: u64, value: u32) {
    if let Err(e) = bus.write_u32(addr, value) {
        tracing::warn!("write {:#x} <- {:#x}: {}; dropped", addr, value, e);
    }
}

fn modify_reg(bus: &mut SystemBus, addr: u64, f: impl FnOnce(u32) -> u32) {
    let value = read_reg(bus, addr);
    write_reg(bus, addr, f(value));
}

/// Sets the four configuration bits of one pin in CRL/CRH.
fn configure_pin(bus: &mut SystemBus, port: u64, pin: u8, mode: u32) {
    let cr = port + if pin < 8 { 0x00 } else { 0x04 };
    let shift = (pin as u32 % 8) * 4;
    modify_reg(bus, cr, |v| (v & !(0xF << shift)) | (mode << shift));
}

/// Platform bring-up that happens before the engine runs: clock tree to
/// 72 MHz from an 8 MHz crystal, then the bus clocks for every block the
/// self-test touches.
pub fn bring_up(bus: &SharedBus) {
    let mut bus = lock(bus);
    // HSEON, PLLSRC = HSE, PLLMUL = 9, APB1 = HCLK / 2, then PLLON and SW = PLL.
    modify_reg(&mut bus, RCC_BASE, |v| v | 1 << 16);
    write_reg(&mut bus, RCC_BASE + 0x04, 1 << 16 | 0b0111 << 18 | 0b100 << 8);
    modify_reg(&mut bus, RCC_BASE, |v| v | 1 << 24);
    modify_reg(&mut bus, RCC_BASE + 0x04, |v| (v & !0b11) | 0b10);

    let apb2 = Apb2::AFIO | Apb2::IOPA | Apb2::IOPB | Apb2::IOPC;
    modify_reg(&mut bus, RCC_BASE + 0x18, |v| v | apb2.bits());
    modify_reg(&mut bus, RCC_BASE + 0x1C, |v| v | Apb1::TIM4.bits());
    tracing::debug!("Clocks up, APB2 {:?}, APB1 {:?}", apb2, Apb1::TIM4);
}

/// One open-drain LED output.
#[derive(Debug, Clone)]
pub struct SimLed {
    bus: SharedBus,
    port: u64,
    pin: u8,
}

impl SimLed {
    pub fn new(bus: SharedBus, port: u64, pin: u8) -> Self {
        Self { bus, port, pin }
    }
}

impl Indicator for SimLed {
    fn configure(&mut self) {
        let mut bus = lock(&self.bus);
        // Drive high (unlit) before the pin becomes an output.
        write_reg(&mut bus, self.port + 0x10, 1 << self.pin);
        configure_pin(&mut bus, self.port, self.pin, MODE_OPEN_DRAIN_2MHZ);
    }

    fn set(&mut self, level: Level) {
        let mut bus = lock(&self.bus);
        if level.is_lit() {
            write_reg(&mut bus, self.port + 0x14, 1 << self.pin); // BRR
        } else {
            write_reg(&mut bus, self.port + 0x10, 1 << self.pin); // BSRR
        }
    }
}

/// Both LEDs, driven in lockstep.
pub fn indicators(bus: &SharedBus) -> [SimLed; 2] {
    INDICATORS.map(|(_, port, pin)| SimLed::new(bus.clone(), port, pin))
}

/// USART1 on PA9 (TX) / PA10 (RX).
#[derive(Debug, Clone)]
pub struct SimSerial {
    bus: SharedBus,
    pclk_hz: u32,
}

impl SimSerial {
    pub fn new(bus: SharedBus, pclk_hz: u32) -> Self {
        Self { bus, pclk_hz }
    }
}

impl SerialTx for SimSerial {
    fn configure(&mut self, config: SerialConfig) {
        let mut bus = lock(&self.bus);
        modify_reg(&mut bus, RCC_BASE + 0x18, |v| v | Apb2::USART1.bits());

        configure_pin(&mut bus, GPIOA_BASE, 9, MODE_AF_PUSH_PULL_10MHZ);
        configure_pin(&mut bus, GPIOA_BASE, 10, MODE_INPUT_PULL);
        write_reg(&mut bus, GPIOA_BASE + 0x10, 1 << 10); // pull up

        write_reg(&mut bus, USART1_BASE + 0x08, self.pclk_hz / config.baud.max(1));

        let stop = if config.stop_bits >= 2 { 0b10 } else { 0b00 };
        write_reg(&mut bus, USART1_BASE + 0x10, stop << 12);

        let mut cr1 = UsartCr1::UE | UsartCr1::TE | UsartCr1::RE;
        let parity_bit = u8::from(config.parity != Parity::None);
        if config.data_bits + parity_bit >= 9 {
            cr1 |= UsartCr1::M;
        }
        match config.parity {
            Parity::None => {}
            Parity::Even => cr1 |= UsartCr1::PCE,
            Parity::Odd => cr1 |= UsartCr1::PCE | UsartCr1::PS,
        }
        write_reg(&mut bus, USART1_BASE + 0x0C, cr1.bits());
    }

    fn transmit(&mut self, byte: u8) {
        // No TXE wait: at one byte per half second the register is always free.
        write_reg(&mut lock(&self.bus), USART1_BASE + 0x04, byte as u32);
    }
}

/// TIM4 as the heartbeat time base.
#[derive(Debug, Clone)]
pub struct SimTimer {
    bus: SharedBus,
    clock_hz: u32,
}

impl SimTimer {
    pub fn new(bus: SharedBus, clock_hz: u32) -> Self {
        Self { bus, clock_hz }
    }
}

impl PeriodicTimer for SimTimer {
    fn start(&mut self, period: Duration) {
        // 100 us ticks.
        let psc = (self.clock_hz / 10_000).saturating_sub(1);
        let arr = (period_micros(period) / 100).saturating_sub(1);

        let mut bus = lock(&self.bus);
        write_reg(&mut bus, TIM4_BASE + 0x28, psc);
        write_reg(&mut bus, TIM4_BASE + 0x2C, arr);
        write_reg(&mut bus, TIM4_BASE + 0x0C, 1); // DIER.UIE
        write_reg(&mut bus, TIM4_BASE + 0x04, 0);
        write_reg(&mut bus, TIM4_BASE, (TimCr1::URS | TimCr1::CEN).bits());
        tracing::debug!("TIM4: psc={} arr={}", psc, arr);
    }

    fn clear_pending(&mut self) {
        write_reg(&mut lock(&self.bus), TIM4_BASE + 0x10, 0);
    }
}

/// PRIMASK, plus the lock a running handler holds.
///
/// The interrupt thread runs a handler only while holding the lock with the
/// mask clear, so [`mask`](Self::mask) returning means no handler is running
/// and none will start.
#[derive(Debug, Default)]
pub struct IrqGate {
    primask: Mutex<bool>,
}

impl IrqGate {
    pub fn mask(&self) {
        *lock(&self.primask) = true;
    }

    pub fn is_masked(&self) -> bool {
        *lock(&self.primask)
    }

    /// Exception entry: `None` while masked.
    pub fn enter(&self) -> Option<MutexGuard<'_, bool>> {
        let guard = lock(&self.primask);
        (!*guard).then_some(guard)
    }
}

#[derive(Debug, Clone)]
pub struct SimIrq {
    bus: SharedBus,
    gate: Arc<IrqGate>,
}

impl SimIrq {
    pub fn new(bus: SharedBus, gate: Arc<IrqGate>) -> Self {
        Self { bus, gate }
    }
}

impl InterruptControl for SimIrq {
    fn enable_heartbeat(&mut self) {
        let bit = 1 << (TIM4_IRQ % 32);
        let word = (TIM4_IRQ / 32) as u64 * 4;
        let mut bus = lock(&self.bus);
        if let Err(e) = bus.write_u8(NVIC_BASE + 0x300 + TIM4_IRQ as u64, TIMER_IRQ_PRI << 4) {
            tracing::warn!("NVIC priority: {}", e);
        }
        write_reg(&mut bus, NVIC_BASE + 0x180 + word, bit); // ICPR
        write_reg(&mut bus, NVIC_BASE + word, bit); // ISER
    }

    fn disable_all(&mut self) {
        self.gate.mask();
    }
}

/// SRAM as seen by the memory test.
#[derive(Debug, Clone)]
pub struct SimSram {
    bank: SramBank,
}

impl SimSram {
    pub fn new(bank: SramBank) -> Self {
        Self { bank }
    }
}

impl MemoryCells for SimSram {
    fn write(&mut self, addr: u32, value: u32) {
        self.bank.write_u32(addr as u64, value);
    }

    fn read(&mut self, addr: u32) -> u32 {
        self.bank.read_u32(addr as u64)
    }
}

/// Wires every engine capability to the simulated part.
pub fn assemble(
    bus: &SharedBus,
    gate: &Arc<IrqGate>,
    sram: SramBank,
    window: Window,
    sysclk_hz: u32,
) -> SimBoard {
    Board {
        cells: SimSram::new(sram),
        window,
        timer: SimTimer::new(bus.clone(), sysclk_hz),
        heartbeat_leds: indicators(bus),
        latch_leds: indicators(bus),
        serial: SimSerial::new(bus.clone(), sysclk_hz),
        irq: SimIrq::new(bus.clone(), gate.clone()),
    }
}

/// Observable state of one LED pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorState {
    pub pin: String,
    pub lit: bool,
    /// Level changes on the pin since reset.
    pub edges: u64,
}

pub fn indicator_states(bus: &SystemBus) -> Vec<IndicatorState> {
    INDICATORS
        .iter()
        .map(|&(pin_name, port, pin)| {
            let (lit, edges) = match bus.device_at::<GpioPort>(port) {
                Some(gpio) => (gpio.is_output(pin) && !gpio.output_high(pin), gpio.edges(pin)),
                None => (false, 0),
            };
            IndicatorState {
                pin: pin_name.to_string(),
                lit,
                edges,
            }
        })
        .collect()
}

/// Bytes written to USART1 while the transmitter was off.
pub fn uart_dropped(bus: &SystemBus) -> u64 {
    bus.device_at::<Uart>(USART1_BASE)
        .map(|uart| uart.dropped())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripherals::timer::Timer;

    fn stm32f103() -> SharedBus {
        let mut bus = SystemBus::new();
        bus.map("rcc", RCC_BASE, 0x400, None, Box::new(crate::peripherals::rcc::Rcc::new()))
            .unwrap();
        for (name, base) in [("gpioa", GPIOA_BASE), ("gpiob", GPIOB_BASE), ("gpioc", GPIOC_BASE)] {
            bus.map(name, base, 0x400, None, Box::new(GpioPort::new()))
                .unwrap();
        }
        bus.map("usart1", USART1_BASE, 0x400, Some(37), Box::new(Uart::new()))
            .unwrap();
        bus.map("tim4", TIM4_BASE, 0x400, Some(TIM4_IRQ), Box::new(Timer::new()))
            .unwrap();
        Arc::new(Mutex::new(bus))
    }

    #[test]
    fn test_leds_configure_unlit_then_follow_level() {
        let bus = stm32f103();
        let mut leds = indicators(&bus);
        leds.configure();
        {
            let states = indicator_states(&lock(&bus));
            assert!(states.iter().all(|s| !s.lit));
        }

        leds.set(Level::On);
        assert!(indicator_states(&lock(&bus)).iter().all(|s| s.lit));
        leds.set(Level::Off);
        assert!(indicator_states(&lock(&bus)).iter().all(|s| !s.lit));
        leds.set(Level::Fault);
        let states = indicator_states(&lock(&bus));
        assert!(states.iter().all(|s| s.lit));
        assert_eq!(states[0].pin, "PB12");
        assert_eq!(states[1].pin, "PC13");
    }

    #[test]
    fn test_serial_config_9600_8n1() {
        let bus = stm32f103();
        let sink = Arc::new(Mutex::new(Vec::new()));
        lock(&bus).attach_uart_tx_sink(sink.clone(), false);

        let mut serial = SimSerial::new(bus.clone(), 72_000_000);
        serial.configure(chipcheck_selftest::SERIAL_CONFIG);
        serial.transmit(b'.');

        let guard = lock(&bus);
        let uart = guard.device_at::<Uart>(USART1_BASE).unwrap();
        assert_eq!(uart.brr(), 7500);
        assert_eq!(uart.stop_field(), 0);
        assert!(!uart.control().contains(UsartCr1::M));
        assert!(!uart.control().contains(UsartCr1::PCE));
        assert_eq!(sink.lock().unwrap().as_slice(), b".");

        let gpioa = guard.device_at::<GpioPort>(GPIOA_BASE).unwrap();
        assert_eq!(gpioa.mode(9), MODE_AF_PUSH_PULL_10MHZ);
        assert_eq!(gpioa.mode(10), MODE_INPUT_PULL);
    }

    #[test]
    fn test_bytes_before_configure_are_dropped() {
        let bus = stm32f103();
        let sink = Arc::new(Mutex::new(Vec::new()));
        lock(&bus).attach_uart_tx_sink(sink.clone(), false);

        let mut serial = SimSerial::new(bus.clone(), 72_000_000);
        serial.transmit(b'.');
        assert_eq!(uart_dropped(&lock(&bus)), 1);

        serial.configure(chipcheck_selftest::SERIAL_CONFIG);
        serial.transmit(b'.');
        assert_eq!(uart_dropped(&lock(&bus)), 1);
        assert_eq!(sink.lock().unwrap().as_slice(), b".");
    }

    #[test]
    fn test_timer_programmed_for_half_second() {
        let bus = stm32f103();
        let mut timer = SimTimer::new(bus.clone(), 72_000_000);
        timer.start(chipcheck_selftest::HEARTBEAT_PERIOD);

        let guard = lock(&bus);
        let tim = guard.device_at::<Timer>(TIM4_BASE).unwrap();
        assert_eq!(tim.prescaler(), 7199);
        assert_eq!(tim.reload(), 4999);
        assert!(tim.control().contains(TimCr1::CEN | TimCr1::URS));
    }

    #[test]
    fn test_missing_timer_is_silent() {
        let mut bare = SystemBus::new();
        bare.map("gpiob", GPIOB_BASE, 0x400, None, Box::new(GpioPort::new()))
            .unwrap();
        let bus = Arc::new(Mutex::new(bare));
        let mut timer = SimTimer::new(bus.clone(), 72_000_000);
        timer.start(chipcheck_selftest::HEARTBEAT_PERIOD);
        assert!(lock(&bus).advance(72_000_000).is_empty());
    }

    #[test]
    fn test_enable_heartbeat_sets_iser_and_priority() {
        let bus = stm32f103();
        let gate = Arc::new(IrqGate::default());
        let nvic = lock(&bus).nvic.clone();
        nvic.set_pending(TIM4_IRQ);

        let mut irq = SimIrq::new(bus.clone(), gate.clone());
        irq.enable_heartbeat();
        assert!(nvic.is_enabled(TIM4_IRQ));
        assert!(!nvic.is_pending(TIM4_IRQ));
        assert_eq!(nvic.priority(TIM4_IRQ), 0x10);

        assert!(gate.enter().is_some());
        irq.disable_all();
        assert!(gate.is_masked());
        assert!(gate.enter().is_none());
    }
}
