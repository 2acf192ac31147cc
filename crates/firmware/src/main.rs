//! Genuineness self-test for boards sold as STM32F103C8.
//!
//! - LED blinks at 2 Hz and USART1 prints a `.` every 500 ms: TIM4 and
//!   20 KiB of SRAM are both there.
//! - LED never lights: no TIM4.
//! - LED stays lit: SRAM failed the fill/verify test.
//!
//! The LED is on PB12 or PC13 depending on the board; both are driven.

#![no_main]
#![no_std]

use core::cell::RefCell;
use core::ptr::{addr_of, read_volatile, write_volatile};
use core::time::Duration;

use cortex_m::interrupt::Mutex;
use cortex_m_rt::entry;
use panic_halt as _;
use stm32f1::stm32f103::interrupt;

use chipcheck_selftest::hal::period_micros;
use chipcheck_selftest::{
    configure, Board, Heartbeat, Indicator, InterruptControl, Level, MemoryCells, Parity,
    PeriodicTimer, SerialConfig, SerialTx, Window,
};

const SYSCLK_HZ: u32 = 72_000_000;

const FLASH_ACR: u32 = 0x4002_2000;
const RCC: u32 = 0x4002_1000;
const GPIOA: u32 = 0x4001_0800;
const GPIOB: u32 = 0x4001_0C00;
const GPIOC: u32 = 0x4001_1000;
const USART1: u32 = 0x4001_3800;
const TIM4: u32 = 0x4000_0800;
const NVIC_ISER: u32 = 0xE000_E100;
const NVIC_ICPR: u32 = 0xE000_E280;
const NVIC_IPR: u32 = 0xE000_E400;

const TIM4_IRQ: u32 = 30;
const TIMER_IRQ_PRI: u8 = 1;

// CNF/MODE nibbles for CRL/CRH.
const MODE_OPEN_DRAIN_2MHZ: u32 = 0b0110;
const MODE_AF_PUSH_PULL_10MHZ: u32 = 0b1001;
const MODE_INPUT_PULL: u32 = 0b1000;

extern "C" {
    /// End of .bss, provided by cortex-m-rt's link.x.
    static __sheap: u32;
}

type FwHeartbeat = Heartbeat<Tim4, [Led; 2], Usart1>;

static HEARTBEAT: Mutex<RefCell<Option<FwHeartbeat>>> = Mutex::new(RefCell::new(None));

fn reg(addr: u32) -> *mut u32 {
    addr as *mut u32
}

fn write_reg(addr: u32, value: u32) {
    unsafe { write_volatile(reg(addr), value) }
}

fn read_reg(addr: u32) -> u32 {
    unsafe { read_volatile(reg(addr)) }
}

fn modify_reg(addr: u32, f: impl FnOnce(u32) -> u32) {
    write_reg(addr, f(read_reg(addr)));
}

fn configure_pin(port: u32, pin: u8, mode: u32) {
    let cr = port + if pin < 8 { 0x00 } else { 0x04 };
    let shift = (pin as u32 % 8) * 4;
    modify_reg(cr, |v| (v & !(0xF << shift)) | (mode << shift));
}

/// 72 MHz from the 8 MHz crystal, APB1 at 36 MHz (TIM4 still sees 72 MHz),
/// then clocks for every block the self-test uses.
fn bring_up() {
    write_reg(FLASH_ACR, 0x12); // prefetch on, two wait states

    modify_reg(RCC, |v| v | 1 << 16); // HSEON
    while read_reg(RCC) & 1 << 17 == 0 {}

    write_reg(RCC + 0x04, 1 << 16 | 0b0111 << 18 | 0b100 << 8);
    modify_reg(RCC, |v| v | 1 << 24); // PLLON
    while read_reg(RCC) & 1 << 25 == 0 {}

    modify_reg(RCC + 0x04, |v| (v & !0b11) | 0b10);
    while (read_reg(RCC + 0x04) >> 2) & 0b11 != 0b10 {}

    // AFIO, IOPA, IOPB, IOPC on APB2; TIM4 on APB1.
    modify_reg(RCC + 0x18, |v| v | 1 | 1 << 2 | 1 << 3 | 1 << 4);
    modify_reg(RCC + 0x1C, |v| v | 1 << 2);
}

/// Open-drain LED to VDD: low is lit.
struct Led {
    port: u32,
    pin: u8,
}

impl Indicator for Led {
    fn configure(&mut self) {
        write_reg(self.port + 0x10, 1 << self.pin);
        configure_pin(self.port, self.pin, MODE_OPEN_DRAIN_2MHZ);
    }

    fn set(&mut self, level: Level) {
        if level.is_lit() {
            write_reg(self.port + 0x14, 1 << self.pin);
        } else {
            write_reg(self.port + 0x10, 1 << self.pin);
        }
    }
}

fn leds() -> [Led; 2] {
    [Led { port: GPIOB, pin: 12 }, Led { port: GPIOC, pin: 13 }]
}

struct Usart1;

impl SerialTx for Usart1 {
    fn configure(&mut self, config: SerialConfig) {
        modify_reg(RCC + 0x18, |v| v | 1 << 14);

        configure_pin(GPIOA, 9, MODE_AF_PUSH_PULL_10MHZ);
        configure_pin(GPIOA, 10, MODE_INPUT_PULL);
        write_reg(GPIOA + 0x10, 1 << 10);

        write_reg(USART1 + 0x08, SYSCLK_HZ / config.baud);
        let stop = if config.stop_bits >= 2 { 0b10 } else { 0b00 };
        write_reg(USART1 + 0x10, stop << 12);

        // UE | TE | RE
        let mut cr1 = 1 << 13 | 1 << 3 | 1 << 2;
        match config.parity {
            Parity::None => {}
            Parity::Even => cr1 |= 1 << 10,
            Parity::Odd => cr1 |= 1 << 10 | 1 << 9,
        }
        if config.data_bits + u8::from(config.parity != Parity::None) >= 9 {
            cr1 |= 1 << 12;
        }
        write_reg(USART1 + 0x0C, cr1);
    }

    fn transmit(&mut self, byte: u8) {
        write_reg(USART1 + 0x04, byte as u32);
    }
}

struct Tim4;

impl PeriodicTimer for Tim4 {
    fn start(&mut self, period: Duration) {
        // 100 us ticks
        write_reg(TIM4 + 0x28, SYSCLK_HZ / 10_000 - 1);
        write_reg(TIM4 + 0x2C, period_micros(period) / 100 - 1);
        write_reg(TIM4 + 0x0C, 1); // UIE
        write_reg(TIM4 + 0x04, 0);
        write_reg(TIM4, 1 << 2 | 1); // URS | CEN
    }

    fn clear_pending(&mut self) {
        write_reg(TIM4 + 0x10, 0);
    }
}

struct Irq;

impl InterruptControl for Irq {
    fn enable_heartbeat(&mut self) {
        let bit = 1 << (TIM4_IRQ % 32);
        let word = (TIM4_IRQ / 32) * 4;
        unsafe { write_volatile((NVIC_IPR + TIM4_IRQ) as *mut u8, TIMER_IRQ_PRI << 4) };
        write_reg(NVIC_ICPR + word, bit);
        write_reg(NVIC_ISER + word, bit);
    }

    fn disable_all(&mut self) {
        // Thread mode: once PRIMASK is set no handler is running.
        cortex_m::interrupt::disable();
    }
}

struct Sram;

impl MemoryCells for Sram {
    fn write(&mut self, addr: u32, value: u32) {
        write_reg(addr, value)
    }

    fn read(&mut self, addr: u32) -> u32 {
        read_reg(addr)
    }
}

#[entry]
fn main() -> ! {
    bring_up();

    let start = unsafe { addr_of!(__sheap) } as u32;
    let (heartbeat, mut diagnostic) = configure(Board {
        cells: Sram,
        window: Window::up_to_required(start),
        timer: Tim4,
        heartbeat_leds: leds(),
        latch_leds: leds(),
        serial: Usart1,
        irq: Irq,
    });

    cortex_m::interrupt::free(|cs| HEARTBEAT.borrow(cs).replace(Some(heartbeat)));
    diagnostic.arm();

    diagnostic.run().idle()
}

#[interrupt]
fn TIM4() {
    cortex_m::interrupt::free(|cs| {
        if let Some(heartbeat) = HEARTBEAT.borrow(cs).borrow_mut().as_mut() {
            heartbeat.fire();
        }
    });
}
